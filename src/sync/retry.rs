//! Retry manager for handling transient failures with exponential backoff
//!
//! Delays grow as `base × growth^attempt`, are capped at `max_delay_ms` and
//! receive up to 10% of additive random jitter. A `Retry-After` hint from a
//! rate-limited response raises the delay to at least the requested wait.

use crate::config::RetryConfig;
use crate::error::RetryableError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound of additive jitter as a fraction of the computed delay
const JITTER_FRACTION: f64 = 0.1;

/// Retry manager with exponential backoff support
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Create a new RetryManager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails terminally or runs out of
    /// retries
    ///
    /// The closure receives the zero-based attempt number; on success the
    /// number of retries spent is returned alongside the value.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<(T, u32), E>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            let err = match operation(attempt).await {
                Ok(result) => return Ok((result, attempt)),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= self.config.max_retries {
                warn!(
                    attempts = attempt + 1,
                    max_retries = self.config.max_retries,
                    error = %err,
                    "Max retries exhausted"
                );
                return Err(err);
            }

            let backoff = self.delay_for(attempt, err.retry_after_secs());
            debug!(
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );

            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Delay before the retry following `attempt`, honouring a Retry-After hint
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let backoff = self.calculate_backoff(attempt);
        match retry_after_secs {
            Some(secs) => {
                let requested = Duration::from_secs(secs)
                    .min(Duration::from_millis(self.config.max_delay_ms));
                backoff.max(requested)
            }
            None => backoff,
        }
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// Uses exponential backoff: base_delay_ms * growth^attempt, capped at
    /// max_delay_ms, plus 0-10% jitter when enabled
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64 * self.config.growth.powi(attempt as i32);
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter && capped > 0.0 {
            capped + rand::thread_rng().gen_range(0.0..=capped * JITTER_FRACTION)
        } else {
            capped
        };

        Duration::from_micros((delay * 1000.0) as u64)
    }
}
