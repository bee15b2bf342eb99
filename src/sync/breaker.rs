//! Circuit breaker guarding the upstream API
//!
//! Consecutive 5xx responses increment a failure counter. Once the counter
//! reaches the threshold the breaker opens and every call fails fast until
//! the cooldown has elapsed since the last failure; the first check after
//! that closes it again. Any 2xx response resets the counter.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::SyncError;

/// Point-in-time view of the breaker for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub is_open: bool,
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown_secs: u64,
    /// Milliseconds until an open breaker lets the next call through
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct BreakerState {
    is_open: bool,
    failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            cooldown: Duration::seconds(config.cooldown_secs as i64),
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&BreakerConfig::default())
    }

    /// Fail fast if the breaker is open and still cooling down
    pub fn check(&self) -> Result<(), SyncError> {
        self.check_at(Utc::now())
    }

    pub fn check_at(&self, now: DateTime<Utc>) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_open {
            return Ok(());
        }

        let last = state.last_failure_at.unwrap_or(now);
        let elapsed = now - last;
        if elapsed > self.cooldown {
            info!(
                failures = state.failures,
                "Circuit breaker cooldown elapsed, closing"
            );
            *state = BreakerState::default();
            return Ok(());
        }

        let retry_in_ms = (self.cooldown - elapsed).num_milliseconds().max(0) as u64;
        Err(SyncError::CircuitOpen { retry_in_ms })
    }

    /// Count a 5xx response
    ///
    /// Returns true if this failure opened the breaker
    pub fn record_server_error(&self) -> bool {
        self.record_server_error_at(Utc::now())
    }

    pub fn record_server_error_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.failures += 1;
        state.last_failure_at = Some(now);

        if !state.is_open && state.failures >= self.threshold {
            state.is_open = true;
            warn!(
                failures = state.failures,
                threshold = self.threshold,
                cooldown_secs = self.cooldown.num_seconds(),
                "Circuit breaker opened"
            );
            return true;
        }
        false
    }

    /// Count a 2xx response
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.failures = 0;
        state.is_open = false;
    }

    /// Operator reset
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = BreakerState::default();
        info!("Circuit breaker reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let retry_in_ms = match (state.is_open, state.last_failure_at) {
            (true, Some(last)) => Some((self.cooldown - (now - last)).num_milliseconds().max(0) as u64),
            _ => None,
        };

        BreakerSnapshot {
            is_open: state.is_open,
            failures: state.failures,
            last_failure_at: state.last_failure_at,
            threshold: self.threshold,
            cooldown_secs: self.cooldown.num_seconds().max(0) as u64,
            retry_in_ms,
        }
    }
}
