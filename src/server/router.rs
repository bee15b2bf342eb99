//! HTTP router for the sync control surface
//!
//! Routes:
//! - `GET /health`, `GET /api/upstream/probe`
//! - `POST /api/sync/run`, `POST /api/sync/stop`, `GET /api/sync/status`,
//!   `GET /api/sync/runs`, `GET /api/sync/events` (server-sent events)
//! - `GET /api/dlq`, `POST /api/dlq/:id/requeue`, `POST /api/dlq/requeue-all`,
//!   `DELETE /api/dlq/:id`, `DELETE /api/dlq`
//! - `GET /api/breaker`, `POST /api/breaker/reset`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, RwLock};

use crate::database::Database;
use crate::error::{DlqError, SyncError};
use crate::models::{EntityKind, ProgressEvent, RunRequest};
use crate::sync::{
    CircuitBreaker, DeadLetterQueue, ManualRunHandle, ProgressBus, ResilientClient,
    SchedulerStatus, SyncEngine, SyncOrchestrator,
};

/// Shared application state
pub struct AppState<D: Database> {
    pub database: Arc<D>,
    pub orchestrator: Arc<SyncOrchestrator<D>>,
    pub dlq: Arc<DeadLetterQueue<D>>,
    pub breaker: Arc<CircuitBreaker>,
    pub client: Arc<ResilientClient>,
    pub progress: Arc<ProgressBus>,
    pub scheduler_status: Arc<RwLock<SchedulerStatus>>,
    pub manual_runs: ManualRunHandle,
}

impl<D: Database + 'static> AppState<D> {
    pub fn new(
        engine: &SyncEngine<D>,
        scheduler_status: Arc<RwLock<SchedulerStatus>>,
        manual_runs: ManualRunHandle,
    ) -> Self {
        Self {
            database: engine.db.clone(),
            orchestrator: engine.orchestrator.clone(),
            dlq: engine.dlq.clone(),
            breaker: engine.breaker.clone(),
            client: engine.client.clone(),
            progress: engine.progress.clone(),
            scheduler_status,
            manual_runs,
        }
    }
}

impl<D: Database> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            database: Arc::clone(&self.database),
            orchestrator: Arc::clone(&self.orchestrator),
            dlq: Arc::clone(&self.dlq),
            breaker: Arc::clone(&self.breaker),
            client: Arc::clone(&self.client),
            progress: Arc::clone(&self.progress),
            scheduler_status: Arc::clone(&self.scheduler_status),
            manual_runs: self.manual_runs.clone(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    /// Wait for the run to finish instead of answering 202 right away
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

/// Build the main application router
pub fn build_router<D: Database + 'static>(state: AppState<D>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/upstream/probe", get(probe_handler::<D>))
        // Runs
        .route("/api/sync/run", post(run_handler::<D>))
        .route("/api/sync/stop", post(stop_handler::<D>))
        .route("/api/sync/status", get(status_handler::<D>))
        .route("/api/sync/runs", get(runs_handler::<D>))
        .route("/api/sync/events", get(events_handler::<D>))
        // Dead letter queue
        .route("/api/dlq", get(dlq_list_handler::<D>))
        .route("/api/dlq", delete(dlq_clear_handler::<D>))
        .route("/api/dlq/requeue-all", post(dlq_requeue_all_handler::<D>))
        .route("/api/dlq/:id/requeue", post(dlq_requeue_handler::<D>))
        .route("/api/dlq/:id", delete(dlq_delete_handler::<D>))
        // Circuit breaker
        .route("/api/breaker", get(breaker_handler::<D>))
        .route("/api/breaker/reset", post(breaker_reset_handler::<D>))
        .with_state(state)
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// =============================================================================
// Health
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Reach the upstream even while the breaker is open
async fn probe_handler<D: Database + 'static>(State(state): State<AppState<D>>) -> Response {
    match state.client.probe(EntityKind::Owners.path()).await {
        Ok(response) => Json(serde_json::json!({
            "reachable": true,
            "status": response.status,
            "elapsedMs": response.elapsed.as_millis() as u64,
            "rateLimit": response.rate_limit,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Upstream probe failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "reachable": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Runs
// =============================================================================

async fn run_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Query(query): Query<RunQuery>,
    body: Option<Json<RunRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if !query.wait {
        let manual_runs = state.manual_runs.clone();
        tokio::spawn(async move {
            if let Err(e) = manual_runs.trigger(request).await {
                tracing::warn!(error = %e, "Manual run failed");
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        )
            .into_response();
    }

    match state.manual_runs.trigger(request).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(SyncError::Unavailable(msg)) => error_json(StatusCode::SERVICE_UNAVAILABLE, msg),
        Err(e) => {
            tracing::error!(error = %e, "Manual run failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn stop_handler<D: Database + 'static>(State(state): State<AppState<D>>) -> impl IntoResponse {
    state.orchestrator.request_stop();
    Json(serde_json::json!({ "message": "Stop requested" }))
}

async fn status_handler<D: Database + 'static>(State(state): State<AppState<D>>) -> Response {
    let cursors = state.orchestrator.cursors();
    let checkpoints = async {
        Ok::<_, crate::error::DbError>((
            cursors.last_full_sync().await?,
            cursors.last_incremental_sync().await?,
        ))
    }
    .await;

    let (last_full, last_incremental) = match checkpoints {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read sync checkpoints");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read sync state");
        }
    };

    let scheduler = state.scheduler_status.read().await.clone();
    Json(serde_json::json!({
        "live": state.progress.status(),
        "scheduler": scheduler,
        "breaker": state.breaker.snapshot(),
        "lastFullSyncAt": last_full,
        "lastIncrementalSyncAt": last_incremental,
    }))
    .into_response()
}

async fn runs_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state.orchestrator.run_history(query.limit.min(500)).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load run history");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load run history")
        }
    }
}

/// Replay of recent events followed by live ones
async fn events_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (replay, rx) = state.progress.subscribe();

    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let events = stream::iter(replay)
        .chain(live)
        .map(|event| Ok(to_sse_event(&event)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(data)
}

// =============================================================================
// Dead letter queue
// =============================================================================

fn dlq_error(e: DlqError) -> Response {
    match e {
        DlqError::NotFound(id) => {
            error_json(StatusCode::NOT_FOUND, format!("DLQ item not found: {}", id))
        }
        e @ DlqError::RetriesExhausted { .. } => error_json(StatusCode::CONFLICT, e.to_string()),
        DlqError::Database(e) => {
            tracing::error!(error = %e, "DLQ storage error");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "DLQ storage error")
        }
    }
}

async fn dlq_list_handler<D: Database + 'static>(State(state): State<AppState<D>>) -> Response {
    match state.dlq.list().await {
        Ok(items) => Json(serde_json::json!({ "total": items.len(), "items": items })).into_response(),
        Err(e) => dlq_error(e),
    }
}

async fn dlq_requeue_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Path(id): Path<String>,
) -> Response {
    match state.dlq.requeue(&id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => dlq_error(e),
    }
}

async fn dlq_requeue_all_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> Response {
    match state.dlq.requeue_all().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => dlq_error(e),
    }
}

async fn dlq_delete_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Path(id): Path<String>,
) -> Response {
    match state.dlq.delete(&id).await {
        Ok(()) => Json(serde_json::json!({ "message": "DLQ item deleted" })).into_response(),
        Err(e) => dlq_error(e),
    }
}

async fn dlq_clear_handler<D: Database + 'static>(State(state): State<AppState<D>>) -> Response {
    match state.dlq.clear_all().await {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => dlq_error(e),
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

async fn breaker_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    Json(state.breaker.snapshot())
}

async fn breaker_reset_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    state.breaker.reset();
    tracing::info!("Circuit breaker reset by operator");
    Json(state.breaker.snapshot())
}
