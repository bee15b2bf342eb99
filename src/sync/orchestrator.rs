//! Sync orchestrator
//!
//! One run walks `Idle -> LockAcquired -> Running -> Finalizing -> Idle`:
//!
//! 1. Resolve the entity list and mode. Full mode runs at most once per UTC
//!    day, from the configured hour on; everything else is incremental.
//! 2. Take the advisory lease. If someone else holds it the run is skipped,
//!    which is logged and audited but is not an error.
//! 3. Sync entities one after another. A failing entity is recorded, sent
//!    to the DLQ and the loop moves on; its cursor stays where it was.
//! 4. Advance cursors of the entities that succeeded, write the checkpoint
//!    and the terminal audit event, and always release the lease.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::cursor::CursorStore;
use super::dlq::{DeadLetterQueue, Reprocessor};
use super::id::generate_id;
use super::lock::{LockAcquisition, SyncLock};
use super::mappers::EntityMappers;
use super::paginator::Paginator;
use super::progress::ProgressBus;
use super::scheduler::SyncRunner;
use crate::config::SyncConfig;
use crate::database::Database;
use crate::error::SyncError;
use crate::models::{
    AuditEvent, EntityKind, EntityResult, FailureContext, OrchestratorState, ProgressEvent,
    ProgressKind, RunOutcome, RunRequest, SyncMode, SyncRun,
};
use crate::otel::SyncMetrics;

/// Audit table name for run events
pub const RUN_REF_TABLE: &str = "sync_runs";

/// Query parameter carrying the incremental lower bound
pub const UPDATED_SINCE_PARAM: &str = "updated_since";

/// Pick full mode once per UTC day from `full_sync_hour` on
pub fn select_mode(
    now: DateTime<Utc>,
    last_full_sync: Option<DateTime<Utc>>,
    full_sync_hour: u32,
) -> SyncMode {
    if now.hour() < full_sync_hour {
        return SyncMode::Incremental;
    }
    match last_full_sync {
        Some(last) if last.date_naive() == now.date_naive() => SyncMode::Incremental,
        _ => SyncMode::Full,
    }
}

/// An entity sync that stopped early
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub error: SyncError,
    /// Counters up to the failure
    pub result: EntityResult,
    /// Last page fetched successfully
    pub last_page: Option<u32>,
}

/// Fetches, maps and stores a single entity
pub struct EntitySyncer<D: Database> {
    paginator: Arc<Paginator>,
    mappers: Arc<EntityMappers<D>>,
    page_size: u32,
    progress: Arc<ProgressBus>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl<D: Database> EntitySyncer<D> {
    pub fn new(
        paginator: Arc<Paginator>,
        mappers: Arc<EntityMappers<D>>,
        page_size: u32,
        progress: Arc<ProgressBus>,
    ) -> Self {
        Self {
            paginator,
            mappers,
            page_size,
            progress,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sync one entity page by page
    ///
    /// Each page is mapped and upserted before the next is requested, so a
    /// failure part-way leaves earlier pages stored. Upserts are idempotent,
    /// which makes replaying the same window safe.
    pub async fn sync_entity(
        &self,
        run_id: &str,
        entity: EntityKind,
        since: Option<DateTime<Utc>>,
        dry_run: bool,
    ) -> Result<EntityResult, EntityFailure> {
        self.fetch_and_store(run_id, entity, since, dry_run, true)
            .await
    }

    /// `live` controls whether the live status and progress bus are fed
    async fn fetch_and_store(
        &self,
        run_id: &str,
        entity: EntityKind,
        since: Option<DateTime<Utc>>,
        dry_run: bool,
        live: bool,
    ) -> Result<EntityResult, EntityFailure> {
        let mut result = EntityResult::new(entity);
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push((UPDATED_SINCE_PARAM.to_string(), since.to_rfc3339()));
        }

        if live {
            self.progress.begin_entity(entity);
        }
        let mut pages = self.paginator.pages(entity.path(), query, self.page_size);
        let mut last_page = None;

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(error) => {
                    return Err(EntityFailure {
                        error,
                        result,
                        last_page,
                    })
                }
            };

            let outcome = match self.mappers.apply(entity, &page.items, dry_run).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    return Err(EntityFailure {
                        error: e.into(),
                        result,
                        last_page,
                    })
                }
            };

            result.pages = page.index;
            result.fetched += outcome.fetched;
            result.upserted += outcome.upserted;
            last_page = Some(page.index);

            if let Some(metrics) = &self.metrics {
                metrics.record_page(entity);
                metrics.record_rows_upserted(entity, outcome.upserted);
            }
            if live {
                self.progress
                    .record_page(page.index, result.fetched, page.total_pages);
                self.progress.publish(
                    ProgressEvent::new(
                        ProgressKind::Page,
                        format!("{} page {}", entity, page.index),
                    )
                    .with_run(run_id)
                    .with_entity(entity)
                    .with_page(page.index, result.fetched),
                );
            }
            debug!(
                run_id = %run_id,
                entity = %entity,
                page = page.index,
                rows = result.fetched,
                remaining = ?page.rate_limit.remaining,
                "Page stored"
            );
        }

        Ok(result)
    }
}

#[async_trait]
impl<D: Database + 'static> Reprocessor for EntitySyncer<D> {
    async fn reprocess(
        &self,
        entity: EntityKind,
        context: &FailureContext,
    ) -> Result<EntityResult, SyncError> {
        info!(
            entity = %entity,
            run_id = %context.run_id,
            since = ?context.since,
            "Reprocessing failed entity sync"
        );
        self.fetch_and_store(&context.run_id, entity, context.since, false, false)
            .await
            .map_err(|f| f.error)
    }
}

/// Drives complete sync runs
pub struct SyncOrchestrator<D: Database> {
    db: Arc<D>,
    syncer: Arc<EntitySyncer<D>>,
    dlq: Arc<DeadLetterQueue<D>>,
    lock: SyncLock<D>,
    cursors: CursorStore<D>,
    progress: Arc<ProgressBus>,
    config: SyncConfig,
    instance_id: String,
    stop_requested: AtomicBool,
    metrics: Option<Arc<SyncMetrics>>,
}

impl<D: Database + 'static> SyncOrchestrator<D> {
    pub fn new(
        db: Arc<D>,
        syncer: Arc<EntitySyncer<D>>,
        dlq: Arc<DeadLetterQueue<D>>,
        progress: Arc<ProgressBus>,
        config: SyncConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            lock: SyncLock::new(db.clone(), config.lock_ttl_secs),
            cursors: CursorStore::new(db.clone()),
            db,
            syncer,
            dlq,
            progress,
            config,
            instance_id: instance_id.into(),
            stop_requested: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cursors(&self) -> &CursorStore<D> {
        &self.cursors
    }

    pub fn lock(&self) -> &SyncLock<D> {
        &self.lock
    }

    /// Keep the in-flight run from starting its next entity
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Newest terminal run events, skips included
    pub async fn run_history(&self, limit: u32) -> Result<Vec<AuditEvent>, SyncError> {
        // Each run writes at most two events, so twice the limit is enough
        let events = self
            .db
            .list_audit(RUN_REF_TABLE, limit.saturating_mul(2))
            .await?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_type != "sync.started")
            .take(limit as usize)
            .collect())
    }

    /// Execute one run
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, SyncError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let now = Utc::now();
        let run_id = generate_id();

        let entities = match &request.entities {
            Some(list) if !list.is_empty() => list.clone(),
            _ => self.config.entities.clone(),
        };
        let mode = match request.mode {
            Some(mode) => mode,
            None => match self.cursors.last_full_sync().await {
                Ok(last_full_sync) => {
                    select_mode(now, last_full_sync, self.config.full_sync_hour_utc)
                }
                Err(e) => return Err(self.abort_before_start(&run_id, None, e.into()).await),
            },
        };

        let holder = format!("{}:{}", self.instance_id, run_id);
        let acquisition = match self.lock.acquire(&holder).await {
            Ok(acquisition) => acquisition,
            Err(e) => return Err(self.abort_before_start(&run_id, Some(mode), e.into()).await),
        };
        match acquisition {
            LockAcquisition::Acquired(_) => {}
            LockAcquisition::Held(existing) => {
                info!(
                    run_id = %run_id,
                    holder = %existing.holder,
                    expires_at = %existing.expires_at(),
                    "Sync skipped, lock held"
                );
                self.progress.publish(
                    ProgressEvent::new(
                        ProgressKind::RunSkipped,
                        format!("Lock held by {}", existing.holder),
                    )
                    .with_run(&run_id),
                );
                self.audit(
                    "sync.skipped",
                    &run_id,
                    serde_json::json!({ "holder": existing.holder, "mode": mode }),
                )
                .await;
                return Ok(RunOutcome::Skipped {
                    holder: existing.holder,
                });
            }
        }
        self.progress.set_state(OrchestratorState::LockAcquired);

        let mut run = SyncRun::new(&run_id, entities, mode, request.dry_run, now);
        let outcome = self.execute(&mut run, &request).await;

        self.progress.set_state(OrchestratorState::Finalizing);
        run.finished_at = Some(Utc::now());
        if let Err(e) = outcome {
            error!(run_id = %run.id, error = %e, "Sync run failed");
            run.error = Some(e.to_string());
        }
        self.finalize(&mut run).await;

        if let Err(e) = self.lock.release(&holder).await {
            error!(run_id = %run.id, error = %e, "Failed to release sync lock");
        }
        self.progress.finish_run();

        Ok(RunOutcome::Completed(run))
    }

    /// Record a run that failed before it held the lease
    async fn abort_before_start(
        &self,
        run_id: &str,
        mode: Option<SyncMode>,
        error: SyncError,
    ) -> SyncError {
        error!(run_id = %run_id, mode = ?mode, error = %error, "Sync run failed before starting");
        self.audit(
            "sync.failed",
            run_id,
            serde_json::json!({
                "id": run_id,
                "mode": mode,
                "error": error.to_string(),
            }),
        )
        .await;
        self.progress.publish(
            ProgressEvent::new(ProgressKind::RunFailed, error.to_string()).with_run(run_id),
        );
        error
    }

    async fn execute(&self, run: &mut SyncRun, request: &RunRequest) -> Result<(), SyncError> {
        self.progress.begin_run(&run.id, run.mode);
        info!(
            run_id = %run.id,
            mode = %run.mode,
            entities = ?run.entities,
            dry_run = run.dry_run,
            "Sync run started"
        );
        self.progress.publish(
            ProgressEvent::new(ProgressKind::RunStarted, format!("{} sync started", run.mode))
                .with_run(&run.id),
        );
        self.audit(
            "sync.started",
            &run.id,
            serde_json::json!({
                "mode": run.mode,
                "entities": run.entities,
                "dryRun": run.dry_run,
            }),
        )
        .await;

        for entity in run.entities.clone() {
            if self.stop_requested.load(Ordering::SeqCst) {
                warn!(run_id = %run.id, entity = %entity, "Stop requested, not starting entity");
                return Err(SyncError::Stopped(entity.to_string()));
            }

            let since = match self.since_for(entity, run, request).await {
                Ok(since) => since,
                Err(error) => {
                    let failure = EntityFailure {
                        error,
                        result: EntityResult::new(entity),
                        last_page: None,
                    };
                    self.handle_failure(run, entity, None, failure).await;
                    continue;
                }
            };
            info!(run_id = %run.id, entity = %entity, since = ?since, "Entity sync started");
            self.progress.publish(
                ProgressEvent::new(ProgressKind::EntityStarted, format!("{} started", entity))
                    .with_run(&run.id)
                    .with_entity(entity),
            );

            match self
                .syncer
                .sync_entity(&run.id, entity, since, run.dry_run)
                .await
            {
                Ok(result) => {
                    info!(
                        run_id = %run.id,
                        entity = %entity,
                        fetched = result.fetched,
                        upserted = result.upserted,
                        pages = result.pages,
                        "Entity sync completed"
                    );
                    self.progress.publish(
                        ProgressEvent::new(
                            ProgressKind::EntityCompleted,
                            format!("{} completed", entity),
                        )
                        .with_run(&run.id)
                        .with_entity(entity)
                        .with_rows(result.fetched),
                    );
                    run.results.push(result);
                }
                Err(failure) => {
                    self.handle_failure(run, entity, since, failure).await;
                }
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        run: &mut SyncRun,
        entity: EntityKind,
        since: Option<DateTime<Utc>>,
        failure: EntityFailure,
    ) {
        let message = failure.error.to_string();
        warn!(
            run_id = %run.id,
            entity = %entity,
            fetched = failure.result.fetched,
            last_page = ?failure.last_page,
            error = %message,
            "Entity sync failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_entity_failure(entity);
        }
        self.progress.publish(
            ProgressEvent::new(ProgressKind::EntityFailed, &message)
                .with_run(&run.id)
                .with_entity(entity),
        );

        let context = FailureContext {
            run_id: run.id.clone(),
            mode: run.mode,
            since,
            page: failure.last_page,
        };
        let mut result = failure.result;
        match self.dlq.enqueue(entity, &message, context).await {
            Ok(item) => {
                result.error = Some(message);
                self.progress.publish(
                    ProgressEvent::new(ProgressKind::DlqEnqueued, format!("DLQ item {}", item.id))
                        .with_run(&run.id)
                        .with_entity(entity),
                );
            }
            Err(e) => {
                error!(
                    run_id = %run.id,
                    entity = %entity,
                    error = %e,
                    "Failed to enqueue entity failure"
                );
                result.error = Some(format!("{}; DLQ enqueue failed: {}", message, e));
            }
        }
        run.results.push(result);
    }

    /// Lower bound for an entity; `None` fetches everything
    async fn since_for(
        &self,
        entity: EntityKind,
        run: &SyncRun,
        request: &RunRequest,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        if run.mode == SyncMode::Full {
            return Ok(None);
        }
        if let Some(since) = request.since {
            return Ok(Some(since));
        }
        match self.cursors.cursor(entity).await? {
            Some(cursor) => Ok(Some(cursor)),
            None => Ok(Some(
                run.started_at - Duration::days(self.config.fallback_window_days),
            )),
        }
    }

    async fn finalize(&self, run: &mut SyncRun) {
        let finished_at = run.finished_at.unwrap_or_else(Utc::now);

        if !run.dry_run {
            for result in run.results.iter().filter(|r| r.is_success()) {
                if let Err(e) = self.cursors.advance(result.entity, finished_at).await {
                    error!(run_id = %run.id, entity = %result.entity, error = %e, "Failed to advance cursor");
                    run.error
                        .get_or_insert_with(|| format!("Failed to advance cursor: {}", e));
                }
            }

            if run.error.is_none() {
                if let Err(e) = self.cursors.set_checkpoint(run.mode, finished_at).await {
                    error!(run_id = %run.id, error = %e, "Failed to write checkpoint");
                    run.error = Some(format!("Failed to write checkpoint: {}", e));
                }
            }
        }

        let failed = run.failed_entities();
        let (event_type, kind) = if run.error.is_some() {
            ("sync.failed", ProgressKind::RunFailed)
        } else {
            ("sync.completed", ProgressKind::RunCompleted)
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_run(run.mode, run.duration_ms().unwrap_or(0), run.error.is_none());
        }
        info!(
            run_id = %run.id,
            mode = %run.mode,
            fetched = run.total_fetched(),
            upserted = run.total_upserted(),
            failed = ?failed,
            duration_ms = run.duration_ms().unwrap_or(0),
            "Sync run finished"
        );

        let payload = match serde_json::to_value(&*run) {
            Ok(payload) => payload,
            Err(e) => serde_json::json!({ "id": run.id, "serializationError": e.to_string() }),
        };
        self.audit(event_type, &run.id, payload).await;

        let message = match &run.error {
            Some(e) => e.clone(),
            None if failed.is_empty() => format!("{} rows", run.total_fetched()),
            None => format!("{} rows, {} failed entities", run.total_fetched(), failed.len()),
        };
        self.progress.publish(
            ProgressEvent::new(kind, message)
                .with_run(&run.id)
                .with_rows(run.total_fetched()),
        );
    }

    async fn audit(&self, event_type: &str, run_id: &str, payload: serde_json::Value) {
        let event = AuditEvent::new(event_type, RUN_REF_TABLE, run_id, payload);
        if let Err(e) = self.db.append_audit(&event).await {
            error!(event_type = event_type, run_id = %run_id, error = %e, "Failed to write audit event");
        }
    }
}

#[async_trait]
impl<D: Database + 'static> SyncRunner for SyncOrchestrator<D> {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, SyncError> {
        SyncOrchestrator::run(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, DlqConfig, PaginatorConfig, RetryConfig, UpstreamConfig};
    use crate::database::{MockDatabase, SqliteDatabase};
    use crate::error::DbError;
    use crate::models::LockRecord;
    use crate::sync::breaker::CircuitBreaker;
    use crate::sync::http_client::ResilientClient;
    use crate::sync::lock::LOCK_KEY;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness<D: Database> {
        db: Arc<D>,
        orchestrator: SyncOrchestrator<D>,
        dlq: Arc<DeadLetterQueue<D>>,
    }

    fn harness(
        server: &MockServer,
        db: Arc<SqliteDatabase>,
        entities: Vec<EntityKind>,
    ) -> Harness<SqliteDatabase> {
        harness_with(server, db, entities, PaginatorConfig::default().max_pages)
    }

    fn harness_with<D: Database + 'static>(
        server: &MockServer,
        db: Arc<D>,
        entities: Vec<EntityKind>,
        max_pages: u32,
    ) -> Harness<D> {
        let upstream = UpstreamConfig {
            base_url: Some(server.uri()),
            api_token: Some("tok".to_string()),
            timeout_ms: 2000,
            page_size: 2,
        };
        let retry = RetryConfig {
            max_retries: 0,
            base_delay_ms: 0,
            jitter: false,
            ..RetryConfig::default()
        };
        let breaker = Arc::new(CircuitBreaker::new(&BreakerConfig::default()));
        let client = Arc::new(ResilientClient::new(&upstream, retry, breaker).unwrap());
        let paginator = Arc::new(Paginator::new(
            client,
            PaginatorConfig {
                page_delay_ms: 0,
                low_budget_delay_ms: 0,
                max_pages,
                ..PaginatorConfig::default()
            },
        ));
        let progress = Arc::new(ProgressBus::default());
        let mappers = Arc::new(EntityMappers::new(db.clone()));
        let syncer = Arc::new(EntitySyncer::new(paginator, mappers, 2, progress.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(
            db.clone(),
            syncer.clone(),
            DlqConfig {
                backoff_base_secs: 0,
                ..DlqConfig::default()
            },
        ));
        let config = SyncConfig {
            entities,
            ..SyncConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            syncer,
            dlq.clone(),
            progress,
            config,
            "test-host",
        );
        Harness {
            db,
            orchestrator,
            dlq,
        }
    }

    fn owner(id: u32) -> serde_json::Value {
        json!({ "id": id, "name": format!("Owner {}", id) })
    }

    fn completed(outcome: RunOutcome) -> SyncRun {
        match outcome {
            RunOutcome::Completed(run) => run,
            other => panic!("Expected completed run, got {:?}", other),
        }
    }

    // Test 1: Full mode once per day from the configured hour
    #[test]
    fn test_select_mode() {
        let at = |d: u32, h: u32| Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap();

        assert_eq!(select_mode(at(10, 1), None, 2), SyncMode::Incremental);
        assert_eq!(select_mode(at(10, 2), None, 2), SyncMode::Full);
        assert_eq!(select_mode(at(10, 5), Some(at(9, 3)), 2), SyncMode::Full);
        assert_eq!(
            select_mode(at(10, 5), Some(at(10, 2)), 2),
            SyncMode::Incremental
        );
        assert_eq!(select_mode(at(10, 23), Some(at(10, 0)), 0), SyncMode::Incremental);
    }

    // Test 2: Lock held by someone else skips the run without fetching
    #[tokio::test]
    async fn test_run_skipped_when_lock_held() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let record = LockRecord {
            holder: "other:run".to_string(),
            acquired_at: Utc::now(),
            ttl_secs: 600,
        };
        db.put_state(LOCK_KEY, &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();

        let h = harness(&server, db, vec![EntityKind::Owners]);
        let outcome = h.orchestrator.run(RunRequest::default()).await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Skipped {
                holder: "other:run".to_string()
            }
        );
        let history = h.orchestrator.run_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "sync.skipped");
    }

    // Test 3: One failing entity does not abort its siblings
    #[tokio::test]
    async fn test_entity_failure_isolated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([owner(1)])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/units"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad filter"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tenants"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "t1", "firstName": "Ada", "lastName": "L" }
            ])))
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(
            &server,
            db,
            vec![EntityKind::Owners, EntityKind::Units, EntityKind::Tenants],
        );
        let units_cursor = Utc::now() - Duration::days(2);
        h.orchestrator
            .cursors()
            .advance(EntityKind::Units, units_cursor)
            .await
            .unwrap();

        let run = completed(
            h.orchestrator
                .run(RunRequest {
                    mode: Some(SyncMode::Incremental),
                    ..RunRequest::default()
                })
                .await
                .unwrap(),
        );

        assert_eq!(run.failed_entities(), vec![EntityKind::Units]);
        assert_eq!(run.result_for(EntityKind::Owners).unwrap().upserted, 1);
        assert_eq!(run.result_for(EntityKind::Tenants).unwrap().upserted, 1);
        assert!(run.error.is_none());

        let cursors = h.orchestrator.cursors();
        assert_eq!(
            cursors.cursor(EntityKind::Units).await.unwrap(),
            Some(units_cursor)
        );
        assert_eq!(
            cursors.cursor(EntityKind::Owners).await.unwrap(),
            run.finished_at
        );

        let items = h.dlq.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].entity, EntityKind::Units);
        assert_eq!(items[0].payload.run_id, run.id);
        assert_eq!(items[0].payload.since, Some(units_cursor));

        assert!(h.orchestrator.lock().current().await.unwrap().is_none());
    }

    // Test 4: Incremental runs send the cursor, full runs send nothing
    #[tokio::test]
    async fn test_updated_since_filter() {
        let server = MockServer::start().await;
        let cursor = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        Mock::given(method("GET"))
            .and(path("/owners"))
            .and(query_param(UPDATED_SINCE_PARAM, cursor.to_rfc3339()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(&server, db, vec![EntityKind::Owners]);
        h.orchestrator
            .cursors()
            .advance(EntityKind::Owners, cursor)
            .await
            .unwrap();

        let run = completed(
            h.orchestrator
                .run(RunRequest {
                    mode: Some(SyncMode::Incremental),
                    ..RunRequest::default()
                })
                .await
                .unwrap(),
        );
        assert!(run.failed_entities().is_empty());
        assert!(h
            .orchestrator
            .cursors()
            .last_incremental_sync()
            .await
            .unwrap()
            .is_some());
    }

    // Test 5: Dry runs fetch but write nothing
    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([owner(1)])))
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(&server, db, vec![EntityKind::Owners]);

        let run = completed(
            h.orchestrator
                .run(RunRequest {
                    mode: Some(SyncMode::Full),
                    dry_run: true,
                    ..RunRequest::default()
                })
                .await
                .unwrap(),
        );

        assert_eq!(run.total_fetched(), 1);
        assert_eq!(run.total_upserted(), 0);
        assert_eq!(h.db.count_rows(EntityKind::Owners).await.unwrap(), 0);
        let cursors = h.orchestrator.cursors();
        assert_eq!(cursors.cursor(EntityKind::Owners).await.unwrap(), None);
        assert_eq!(cursors.last_full_sync().await.unwrap(), None);
    }

    // Test 6: Audit trail has one start and one terminal event
    #[tokio::test]
    async fn test_audit_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([owner(1)])))
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(&server, db, vec![EntityKind::Owners]);
        let run = completed(h.orchestrator.run(RunRequest::default()).await.unwrap());

        let events = h.db.list_audit(RUN_REF_TABLE, 10).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["sync.completed", "sync.started"]);
        assert!(events.iter().all(|e| e.ref_id == run.id));
        assert_eq!(events[0].payload["results"][0]["upserted"], 1);
    }

    // Test 7: A stop request keeps the next entity from starting
    #[tokio::test]
    async fn test_request_stop_before_run_is_cleared() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(&server, db, vec![EntityKind::Owners]);

        // A stop issued between runs does not affect the next one
        h.orchestrator.request_stop();
        let run = completed(h.orchestrator.run(RunRequest::default()).await.unwrap());
        assert!(run.error.is_none());
    }

    // Test 8: Live status returns to idle and progress is published
    #[tokio::test]
    async fn test_progress_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([owner(1), owner(2)])),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([owner(3)])))
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(&server, db, vec![EntityKind::Owners]);
        let progress = h.orchestrator.progress.clone();

        let run = completed(h.orchestrator.run(RunRequest::default()).await.unwrap());
        assert_eq!(run.result_for(EntityKind::Owners).unwrap().pages, 2);
        assert_eq!(run.total_upserted(), 3);

        let (events, _rx) = progress.subscribe();
        let kinds: Vec<ProgressKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProgressKind::RunStarted,
                ProgressKind::EntityStarted,
                ProgressKind::Page,
                ProgressKind::Page,
                ProgressKind::EntityCompleted,
                ProgressKind::RunCompleted,
            ]
        );
        assert_eq!(progress.status().state, OrchestratorState::Idle);
    }

    // Test 9: Page cap with more pages pending fails the entity and keeps its cursor
    #[tokio::test]
    async fn test_page_cap_fails_entity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([owner(1), owner(2)])),
            )
            .expect(2)
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness_with(&server, db, vec![EntityKind::Owners], 2);
        let cursor = Utc::now() - Duration::days(1);
        h.orchestrator
            .cursors()
            .advance(EntityKind::Owners, cursor)
            .await
            .unwrap();

        let run = completed(
            h.orchestrator
                .run(RunRequest {
                    mode: Some(SyncMode::Incremental),
                    ..RunRequest::default()
                })
                .await
                .unwrap(),
        );

        assert_eq!(run.failed_entities(), vec![EntityKind::Owners]);
        let result = run.result_for(EntityKind::Owners).unwrap();
        assert!(result.error.as_deref().unwrap().contains("page cap of 2"));
        assert_eq!(result.fetched, 4);

        assert_eq!(
            h.orchestrator.cursors().cursor(EntityKind::Owners).await.unwrap(),
            Some(cursor)
        );
        let items = h.dlq.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].entity, EntityKind::Owners);
        assert_eq!(items[0].payload.page, Some(2));
    }

    // Test 10: A DLQ write failure is recorded on the entity and the run moves on
    #[tokio::test]
    async fn test_dlq_enqueue_failure_does_not_abort_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad filter"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/properties"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ "id": 7, "name": "Elm Court" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut mock = MockDatabase::new();
        mock.expect_get_state().returning(|_| Ok(None));
        mock.expect_put_state().returning(|_, _| Ok(()));
        mock.expect_delete_state().returning(|_| Ok(true));
        mock.expect_append_audit().returning(|_| Ok(1));
        mock.expect_insert_dlq_item()
            .times(1)
            .returning(|_| Err(DbError::NotFound));
        mock.expect_upsert_properties().times(1).returning(|_| Ok(1));

        let h = harness_with(
            &server,
            Arc::new(mock),
            vec![EntityKind::Owners, EntityKind::Properties],
            100,
        );
        let run = completed(
            h.orchestrator
                .run(RunRequest {
                    mode: Some(SyncMode::Full),
                    ..RunRequest::default()
                })
                .await
                .unwrap(),
        );

        assert!(run.error.is_none());
        assert_eq!(run.failed_entities(), vec![EntityKind::Owners]);
        let owners_error = run.result_for(EntityKind::Owners).unwrap().error.clone().unwrap();
        assert!(owners_error.contains("DLQ enqueue failed"));
        let properties = run.result_for(EntityKind::Properties).unwrap();
        assert!(properties.is_success());
        assert_eq!(properties.upserted, 1);
    }

    // Test 11: A storage failure before the lease is taken is audited as a failed run
    #[tokio::test]
    async fn test_failure_before_start_is_audited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let mut mock = MockDatabase::new();
        mock.expect_get_state()
            .returning(|_| Err(DbError::Serialization("disk".to_string())));
        mock.expect_append_audit()
            .withf(|event| {
                event.event_type == "sync.failed"
                    && event.ref_table == RUN_REF_TABLE
                    && event.payload["mode"] == "full"
                    && event.payload["error"]
                        .as_str()
                        .is_some_and(|e| e.contains("disk"))
            })
            .times(1)
            .returning(|_| Ok(1));

        let h = harness_with(&server, Arc::new(mock), vec![EntityKind::Owners], 100);
        let progress = h.orchestrator.progress.clone();

        let result = h
            .orchestrator
            .run(RunRequest {
                mode: Some(SyncMode::Full),
                ..RunRequest::default()
            })
            .await;
        assert!(matches!(result, Err(SyncError::Storage(_))));

        let (events, _rx) = progress.subscribe();
        assert_eq!(events.last().map(|e| e.kind), Some(ProgressKind::RunFailed));
    }

    // Test 12: A stop during an entity lets it finish and skips the rest
    #[tokio::test]
    async fn test_request_stop_mid_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([owner(1)]))
                    .set_delay(std::time::Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/properties"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let h = harness(
            &server,
            db,
            vec![EntityKind::Owners, EntityKind::Properties],
        );

        let (outcome, _) = tokio::join!(
            h.orchestrator.run(RunRequest {
                mode: Some(SyncMode::Full),
                ..RunRequest::default()
            }),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                h.orchestrator.request_stop();
            }
        );
        let run = completed(outcome.unwrap());

        assert_eq!(run.error.as_deref(), Some("Run stopped before properties"));
        assert_eq!(run.result_for(EntityKind::Owners).unwrap().upserted, 1);
        assert!(run.result_for(EntityKind::Properties).is_none());
        assert_eq!(h.db.count_rows(EntityKind::Owners).await.unwrap(), 1);

        let history = h.orchestrator.run_history(10).await.unwrap();
        assert_eq!(history[0].event_type, "sync.failed");
        assert_eq!(h.orchestrator.cursors().last_full_sync().await.unwrap(), None);
        assert!(h.orchestrator.lock().current().await.unwrap().is_none());
    }
}
