//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use property_sync::config::Config;
use property_sync::database::SqliteDatabase;
use property_sync::models::EntityKind;
use property_sync::server::AppState;
use property_sync::sync::{EngineOptions, SchedulerConfig, SyncEngine, SyncScheduler};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use wiremock::MockServer;

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Configuration pointing at a mock upstream, with every delay zeroed
pub fn create_test_config(upstream: &MockServer, entities: Vec<EntityKind>) -> Config {
    let mut config = Config::default();
    config.upstream.base_url = Some(upstream.uri());
    config.upstream.api_token = Some("test-token".to_string());
    config.upstream.page_size = 200;
    config.retry.max_retries = 0;
    config.paginator.page_delay_ms = 0;
    config.paginator.low_budget_delay_ms = 0;
    config.dlq.backoff_base_secs = 0;
    config.dlq.max_attempts = 1;
    config.sync.entities = entities;
    config
}

/// Build an engine over a fresh in-memory database
pub async fn create_test_engine(config: &Config) -> SyncEngine<SqliteDatabase> {
    let db = create_test_database().await;
    SyncEngine::build(
        config,
        db,
        EngineOptions {
            instance_id: Some("test-node".to_string()),
            ..EngineOptions::default()
        },
    )
    .expect("Failed to build sync engine")
}

/// Spawn a scheduler for the engine and return the server state
///
/// The scheduler stops when the returned sender is dropped or sent.
pub fn spawn_scheduler(
    config: &Config,
    engine: &SyncEngine<SqliteDatabase>,
) -> (AppState<SqliteDatabase>, broadcast::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = SyncScheduler::new(
        SchedulerConfig::from_config(config),
        engine.orchestrator.clone(),
        shutdown_rx,
    );
    let state = AppState::new(engine, scheduler.status_handle(), scheduler.manual_run_handle());
    tokio::spawn(scheduler.run());
    (state, shutdown_tx)
}

/// Run the HTTP router in the background and return its address
pub async fn run_test_server(
    state: AppState<SqliteDatabase>,
) -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local address");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let app = property_sync::server::build_router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    (addr, shutdown_tx)
}

/// Owner records numbered from `start`
pub fn owners(start: u32, count: u32) -> Value {
    Value::Array(
        (start..start + count)
            .map(|id| json!({ "id": id, "name": format!("Owner {}", id) }))
            .collect(),
    )
}
