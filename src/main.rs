//! property-sync - property-management API synchronization service

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use property_sync::config::Config;
use property_sync::database::SqliteDatabase;
use property_sync::otel::{init_tracing, OtelProvider, SyncMetrics};
use property_sync::server::{AppState, Server};
use property_sync::sync::{EngineOptions, SchedulerConfig, SyncEngine, SyncScheduler};

/// property-sync - property-management API synchronization service
#[derive(Parser, Debug)]
#[command(name = "property-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PROPERTY_SYNC_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let otel_provider = OtelProvider::new(&config.otel)?;
    init_tracing(&otel_provider, &config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting property-sync");

    if config.upstream.base_url.is_none() {
        anyhow::bail!("upstream.base_url must be configured");
    }
    if !config.upstream.has_credentials() {
        warn!("Upstream API token is not configured, scheduled runs are disabled");
    }

    let database = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    let metrics = Arc::new(SyncMetrics::new(&otel_provider.meter()));
    let engine = SyncEngine::build(
        &config,
        database,
        EngineOptions {
            metrics: Some(metrics),
            ..EngineOptions::default()
        },
    )?;
    info!(
        entities = ?config.sync.entities,
        page_size = config.upstream.page_size,
        "Sync engine initialized"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = SyncScheduler::new(
        SchedulerConfig::from_config(&config),
        engine.orchestrator.clone(),
        shutdown_rx,
    );
    let state = AppState::new(&engine, scheduler.status_handle(), scheduler.manual_run_handle());
    let scheduler_handle = tokio::spawn(scheduler.run());

    let orchestrator = engine.orchestrator.clone();
    let shutdown = async move {
        shutdown_signal().await;
        orchestrator.request_stop();
        let _ = shutdown_tx.send(());
    };

    let server = Server::new(config.server.clone(), state);
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting HTTP server"
    );
    let result = server.run(shutdown).await;

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Sync scheduler task failed");
    }

    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("property-sync shutdown complete");

    result.map_err(Into::into)
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // tracing is not initialized yet
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
