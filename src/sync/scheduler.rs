//! Sync scheduler
//!
//! Fires one run after a startup delay and then on a fixed interval. Every
//! tick sends a default request, so the orchestrator re-evaluates full vs.
//! incremental each time; there is no separate full-sync timer. Manual runs
//! arrive over a channel and are executed by the same loop, which keeps runs
//! inside one process strictly sequential.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::models::{RunOutcome, RunRequest};

/// Something that can execute a sync run
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, SyncError>;
}

/// Configuration for the sync scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Whether upstream credentials are configured
    pub has_credentials: bool,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.sync.enabled,
            has_credentials: config.upstream.has_credentials(),
            interval_secs: config.sync.interval_secs,
            initial_delay_secs: config.sync.initial_delay_secs,
        }
    }

    /// Why scheduled runs are off, if they are
    pub fn idle_reason(&self) -> Option<&'static str> {
        if !self.enabled {
            Some("sync.enabled is false")
        } else if !self.has_credentials {
            Some("upstream credentials are not configured")
        } else {
            None
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            has_credentials: false,
            interval_secs: 900,
            initial_delay_secs: 10,
        }
    }
}

/// Scheduler bookkeeping exposed on the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Whether scheduled ticks fire
    pub active: bool,
    pub idle_reason: Option<String>,
    pub ticks: u64,
    pub in_progress: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    /// `completed`, `skipped` or the error message
    pub last_result: Option<String>,
    pub next_tick_at: Option<DateTime<Utc>>,
}

struct ManualRunRequest {
    request: RunRequest,
    response: oneshot::Sender<Result<RunOutcome, SyncError>>,
}

/// Fixed-interval driver for the orchestrator
pub struct SyncScheduler {
    config: SchedulerConfig,
    runner: Arc<dyn SyncRunner>,
    status: Arc<RwLock<SchedulerStatus>>,
    shutdown_rx: broadcast::Receiver<()>,
    manual_run_rx: mpsc::Receiver<ManualRunRequest>,
    manual_run_tx: mpsc::Sender<ManualRunRequest>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn SyncRunner>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (manual_run_tx, manual_run_rx) = mpsc::channel(8);
        let status = SchedulerStatus {
            active: config.idle_reason().is_none(),
            idle_reason: config.idle_reason().map(str::to_string),
            ..SchedulerStatus::default()
        };

        Self {
            config,
            runner,
            status: Arc::new(RwLock::new(status)),
            shutdown_rx,
            manual_run_rx,
            manual_run_tx,
        }
    }

    /// Get a handle for triggering manual runs
    pub fn manual_run_handle(&self) -> ManualRunHandle {
        ManualRunHandle {
            tx: self.manual_run_tx.clone(),
        }
    }

    /// Shared status, readable while the scheduler runs
    pub fn status_handle(&self) -> Arc<RwLock<SchedulerStatus>> {
        self.status.clone()
    }

    /// Run until shutdown is signalled
    pub async fn run(mut self) {
        let active = match self.config.idle_reason() {
            Some(reason) => {
                info!(reason = reason, "Sync scheduler idle, only manual runs are accepted");
                false
            }
            None => {
                info!(
                    interval_secs = self.config.interval_secs,
                    initial_delay_secs = self.config.initial_delay_secs,
                    "Starting sync scheduler"
                );
                true
            }
        };

        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let initial_delay = Duration::from_secs(self.config.initial_delay_secs);
        let mut timer = interval_at(Instant::now() + initial_delay, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if active {
            self.set_next_tick(initial_delay).await;
        }

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
                _ = timer.tick(), if active => {
                    debug!("Scheduled sync tick");
                    self.status.write().await.ticks += 1;
                    let _ = self.perform_run(RunRequest::default()).await;
                    self.set_next_tick(interval).await;
                }
                Some(manual) = self.manual_run_rx.recv() => {
                    self.handle_manual_run(manual).await;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn handle_manual_run(&self, manual: ManualRunRequest) {
        if !self.config.has_credentials {
            warn!("Manual run refused, upstream credentials are not configured");
            let _ = manual.response.send(Err(SyncError::Unavailable(
                "upstream credentials are not configured".to_string(),
            )));
            return;
        }

        info!(
            entities = ?manual.request.entities,
            mode = ?manual.request.mode,
            dry_run = manual.request.dry_run,
            "Manual sync triggered"
        );
        let result = self.perform_run(manual.request).await;
        if manual.response.send(result).is_err() {
            debug!("Manual run requester went away before the result arrived");
        }
    }

    /// Run once; errors and panics are logged and never stop the loop
    async fn perform_run(&self, request: RunRequest) -> Result<RunOutcome, SyncError> {
        self.status.write().await.in_progress = true;

        let runner = self.runner.clone();
        let joined = tokio::spawn(async move { runner.run(request).await }).await;

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Sync run task panicked");
                Err(SyncError::Unavailable(format!("run task failed: {}", e)))
            }
        };

        let summary = match &result {
            Ok(RunOutcome::Completed(run)) => match &run.error {
                Some(e) => e.clone(),
                None => "completed".to_string(),
            },
            Ok(RunOutcome::Skipped { holder }) => {
                debug!(holder = %holder, "Tick skipped, lock held");
                "skipped".to_string()
            }
            Err(e) => {
                error!(error = %e, "Sync run failed");
                e.to_string()
            }
        };

        let mut status = self.status.write().await;
        status.in_progress = false;
        status.last_run_at = Some(Utc::now());
        status.last_result = Some(summary);

        result
    }

    async fn set_next_tick(&self, after: Duration) {
        let next = chrono::Duration::from_std(after)
            .ok()
            .map(|d| Utc::now() + d);
        self.status.write().await.next_tick_at = next;
    }
}

/// Handle for triggering manual runs
#[derive(Clone)]
pub struct ManualRunHandle {
    tx: mpsc::Sender<ManualRunRequest>,
}

impl ManualRunHandle {
    /// Queue a run and wait for its outcome
    pub async fn trigger(&self, request: RunRequest) -> Result<RunOutcome, SyncError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(ManualRunRequest {
                request,
                response: response_tx,
            })
            .await
            .map_err(|_| SyncError::Unavailable("scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| SyncError::Unavailable("no response from scheduler".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, SyncMode, SyncRun};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    /// Counts runs and returns a fixed outcome
    struct TestRunner {
        runs: Arc<AtomicU32>,
        skip: bool,
    }

    impl TestRunner {
        fn new() -> Self {
            Self {
                runs: Arc::new(AtomicU32::new(0)),
                skip: false,
            }
        }

        fn skipping() -> Self {
            Self {
                skip: true,
                ..Self::new()
            }
        }

        fn runs(&self) -> Arc<AtomicU32> {
            self.runs.clone()
        }
    }

    #[async_trait]
    impl SyncRunner for TestRunner {
        async fn run(&self, request: RunRequest) -> Result<RunOutcome, SyncError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.skip {
                return Ok(RunOutcome::Skipped {
                    holder: "other".to_string(),
                });
            }
            let entities = request.entities.unwrap_or_else(|| vec![EntityKind::Owners]);
            let mode = request.mode.unwrap_or(SyncMode::Incremental);
            Ok(RunOutcome::Completed(SyncRun::new(
                "run",
                entities,
                mode,
                request.dry_run,
                Utc::now(),
            )))
        }
    }

    /// Panics on every run
    struct PanickingRunner;

    #[async_trait]
    impl SyncRunner for PanickingRunner {
        async fn run(&self, _request: RunRequest) -> Result<RunOutcome, SyncError> {
            panic!("boom");
        }
    }

    fn active_config(interval_secs: u64, initial_delay_secs: u64) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            has_credentials: true,
            interval_secs,
            initial_delay_secs,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // Test 1: First tick waits for the initial delay, then the interval
    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_then_interval() {
        let runner = TestRunner::new();
        let runs = runner.runs();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let scheduler = SyncScheduler::new(active_config(100, 10), Arc::new(runner), shutdown_rx);
        let handle = tokio::spawn(scheduler.run());
        // Let the task anchor its timer before the clock moves
        settle().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(101)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    // Test 2: Disabled scheduler never ticks
    #[tokio::test(start_paused = true)]
    async fn test_disabled_scheduler_idles() {
        let runner = TestRunner::new();
        let runs = runner.runs();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let config = SchedulerConfig {
            enabled: false,
            ..active_config(10, 0)
        };
        let scheduler = SyncScheduler::new(config, Arc::new(runner), shutdown_rx);
        let status = scheduler.status_handle();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let status = status.read().await.clone();
        assert!(!status.active);
        assert_eq!(status.idle_reason.as_deref(), Some("sync.enabled is false"));

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    // Test 3: Idle reasons
    #[test]
    fn test_idle_reason() {
        assert_eq!(active_config(1, 0).idle_reason(), None);
        assert_eq!(
            SchedulerConfig::default().idle_reason(),
            Some("sync.enabled is false")
        );
        let no_creds = SchedulerConfig {
            has_credentials: false,
            ..active_config(1, 0)
        };
        assert_eq!(
            no_creds.idle_reason(),
            Some("upstream credentials are not configured")
        );
    }

    // Test 4: Manual runs go through the loop and return the outcome
    #[tokio::test]
    async fn test_manual_run() {
        let runner = TestRunner::new();
        let runs = runner.runs();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let config = SchedulerConfig {
            enabled: false,
            ..active_config(3600, 0)
        };
        let scheduler = SyncScheduler::new(config, Arc::new(runner), shutdown_rx);
        let manual = scheduler.manual_run_handle();
        let handle = tokio::spawn(scheduler.run());

        let outcome = manual
            .trigger(RunRequest {
                entities: Some(vec![EntityKind::Leases]),
                mode: Some(SyncMode::Full),
                ..RunRequest::default()
            })
            .await
            .unwrap();

        match outcome {
            RunOutcome::Completed(run) => {
                assert_eq!(run.entities, vec![EntityKind::Leases]);
                assert_eq!(run.mode, SyncMode::Full);
            }
            other => panic!("Expected completed run, got {:?}", other),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    // Test 5: Manual runs are refused without credentials
    #[tokio::test]
    async fn test_manual_run_without_credentials() {
        let runner = TestRunner::new();
        let runs = runner.runs();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let config = SchedulerConfig {
            has_credentials: false,
            ..active_config(3600, 3600)
        };
        let scheduler = SyncScheduler::new(config, Arc::new(runner), shutdown_rx);
        let manual = scheduler.manual_run_handle();
        let handle = tokio::spawn(scheduler.run());

        let result = manual.trigger(RunRequest::default()).await;
        assert!(matches!(result, Err(SyncError::Unavailable(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    // Test 6: A panicking run does not stop later ticks
    #[tokio::test(start_paused = true)]
    async fn test_tick_panic_is_contained() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler =
            SyncScheduler::new(active_config(10, 0), Arc::new(PanickingRunner), shutdown_rx);
        let status = scheduler.status_handle();
        let handle = tokio::spawn(scheduler.run());

        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        let status = status.read().await.clone();
        assert_eq!(status.ticks, 2);
        assert!(!status.in_progress);
        assert!(status
            .last_result
            .as_deref()
            .is_some_and(|r| r.contains("run task failed")));

        shutdown_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }

    // Test 7: Skipped runs are recorded, not treated as errors
    #[tokio::test(start_paused = true)]
    async fn test_skipped_tick_status() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = SyncScheduler::new(
            active_config(10, 0),
            Arc::new(TestRunner::skipping()),
            shutdown_rx,
        );
        let status = scheduler.status_handle();
        let handle = tokio::spawn(scheduler.run());

        settle().await;

        let status = status.read().await.clone();
        assert_eq!(status.ticks, 1);
        assert_eq!(status.last_result.as_deref(), Some("skipped"));
        assert!(status.next_tick_at.is_some());

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    // Test 8: Handle errors once the scheduler is gone
    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler =
            SyncScheduler::new(SchedulerConfig::default(), Arc::new(TestRunner::new()), shutdown_rx);
        let manual = scheduler.manual_run_handle();
        let handle = tokio::spawn(scheduler.run());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let result = manual.trigger(RunRequest::default()).await;
        assert!(matches!(result, Err(SyncError::Unavailable(_))));
    }
}
