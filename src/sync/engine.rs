//! Wiring of the sync components from configuration

use std::sync::Arc;

use super::breaker::CircuitBreaker;
use super::dlq::DeadLetterQueue;
use super::http_client::ResilientClient;
use super::mappers::{EntityMappers, Geocoder};
use super::orchestrator::{EntitySyncer, SyncOrchestrator};
use super::paginator::Paginator;
use super::progress::{ProgressBus, DEFAULT_REPLAY};
use crate::config::Config;
use crate::database::Database;
use crate::error::SyncError;
use crate::otel::SyncMetrics;

/// Optional collaborators
#[derive(Default)]
pub struct EngineOptions {
    pub metrics: Option<Arc<SyncMetrics>>,
    pub geocoder: Option<Arc<dyn Geocoder>>,
    /// Prefix of the lease holder; defaults to the host name or `local`
    pub instance_id: Option<String>,
}

/// Every long-lived sync component, sharing one breaker and progress bus
pub struct SyncEngine<D: Database> {
    pub db: Arc<D>,
    pub breaker: Arc<CircuitBreaker>,
    pub client: Arc<ResilientClient>,
    pub progress: Arc<ProgressBus>,
    pub syncer: Arc<EntitySyncer<D>>,
    pub dlq: Arc<DeadLetterQueue<D>>,
    pub orchestrator: Arc<SyncOrchestrator<D>>,
}

impl<D: Database + 'static> SyncEngine<D> {
    pub fn build(config: &Config, db: Arc<D>, options: EngineOptions) -> Result<Self, SyncError> {
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker));

        let mut client = ResilientClient::new(&config.upstream, config.retry.clone(), breaker.clone())?;
        if let Some(metrics) = &options.metrics {
            client = client.with_metrics(metrics.clone());
        }
        let client = Arc::new(client);

        let paginator = Arc::new(Paginator::new(client.clone(), config.paginator.clone()));
        let progress = Arc::new(ProgressBus::new(DEFAULT_REPLAY));

        let mut mappers = EntityMappers::new(db.clone());
        if let Some(geocoder) = options.geocoder {
            mappers = mappers.with_geocoder(geocoder);
        }

        let mut syncer = EntitySyncer::new(
            paginator,
            Arc::new(mappers),
            config.upstream.page_size,
            progress.clone(),
        );
        if let Some(metrics) = &options.metrics {
            syncer = syncer.with_metrics(metrics.clone());
        }
        let syncer = Arc::new(syncer);

        let mut dlq = DeadLetterQueue::new(db.clone(), syncer.clone(), config.dlq.clone());
        if let Some(metrics) = &options.metrics {
            dlq = dlq.with_metrics(metrics.clone());
        }
        let dlq = Arc::new(dlq);

        let instance_id = options.instance_id.unwrap_or_else(default_instance_id);
        let mut orchestrator = SyncOrchestrator::new(
            db.clone(),
            syncer.clone(),
            dlq.clone(),
            progress.clone(),
            config.sync.clone(),
            instance_id,
        );
        if let Some(metrics) = options.metrics {
            orchestrator = orchestrator.with_metrics(metrics);
        }

        Ok(Self {
            db,
            breaker,
            client,
            progress,
            syncer,
            dlq,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

fn default_instance_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string())
}
