//! Progress bus and live status
//!
//! Run progress fans out over a broadcast channel. A bounded buffer of
//! recent events is kept so a late subscriber (for example a freshly opened
//! event stream) first sees what already happened in the current run.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;

use crate::models::{EntityKind, LiveStatus, OrchestratorState, ProgressEvent, SyncMode};

/// Default number of events replayed to new subscribers
pub const DEFAULT_REPLAY: usize = 200;

/// Broadcast channel capacity per subscriber
const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of progress events plus the live status snapshot
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
    replay: Mutex<VecDeque<ProgressEvent>>,
    replay_capacity: usize,
    status: RwLock<LiveStatus>,
    entity_started: Mutex<Option<Instant>>,
}

impl ProgressBus {
    pub fn new(replay_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            replay: Mutex::new(VecDeque::with_capacity(replay_capacity)),
            replay_capacity,
            status: RwLock::new(LiveStatus::default()),
            entity_started: Mutex::new(None),
        }
    }

    /// Publish an event to subscribers and the replay buffer
    pub fn publish(&self, event: ProgressEvent) {
        {
            let mut replay = self.replay.lock().unwrap_or_else(PoisonError::into_inner);
            if self.replay_capacity > 0 {
                if replay.len() == self.replay_capacity {
                    replay.pop_front();
                }
                replay.push_back(event.clone());
            }
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Recent events plus a receiver for everything after them
    pub fn subscribe(&self) -> (Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let replay = self.replay.lock().unwrap_or_else(PoisonError::into_inner);
        // Subscribing under the buffer lock keeps replay and live events gap-free
        let rx = self.tx.subscribe();
        (replay.iter().cloned().collect(), rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn status(&self) -> LiveStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut LiveStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    pub fn set_state(&self, state: OrchestratorState) {
        self.update_status(|s| s.state = state);
    }

    /// Reset the status for a new run
    pub fn begin_run(&self, run_id: &str, mode: SyncMode) {
        self.update_status(|s| {
            *s = LiveStatus {
                state: OrchestratorState::Running,
                run_id: Some(run_id.to_string()),
                mode: Some(mode),
                started_at: Some(chrono::Utc::now()),
                ..LiveStatus::default()
            };
        });
    }

    pub fn begin_entity(&self, entity: EntityKind) {
        *self
            .entity_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.update_status(|s| {
            s.entity = Some(entity);
            s.page = 0;
            s.total_pages = None;
            s.rows = 0;
            s.rps = 0.0;
            s.eta_secs = None;
        });
    }

    /// Record a fetched page; `rows` is the entity's running total
    pub fn record_page(&self, page: u32, rows: u64, total_pages: Option<u32>) {
        let elapsed = self
            .entity_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let rps = if elapsed > 0.0 { rows as f64 / elapsed } else { 0.0 };
        let eta_secs = estimate_eta(elapsed, page, total_pages);

        self.update_status(|s| {
            s.page = page;
            s.rows = rows;
            s.total_pages = total_pages;
            s.rps = rps;
            s.eta_secs = eta_secs;
        });
    }

    /// Back to idle after a run
    pub fn finish_run(&self) {
        *self
            .entity_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.update_status(|s| *s = LiveStatus::default());
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY)
    }
}

/// Seconds left given the average time per page so far
fn estimate_eta(elapsed_secs: f64, page: u32, total_pages: Option<u32>) -> Option<u64> {
    let total = total_pages?;
    if page == 0 {
        return None;
    }
    let remaining = total.saturating_sub(page) as f64;
    Some((elapsed_secs / page as f64 * remaining).round() as u64)
}
