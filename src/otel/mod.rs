//! Observability for property-sync
//!
//! Tracing subscriber setup plus OpenTelemetry export. When OTLP is
//! disabled the meter provider has no reader, so instruments still work
//! but nothing leaves the process.

use crate::config::{LoggingConfig, OtelConfig};
use crate::error::OtelError;
use crate::models::{EntityKind, SyncMode};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tracer and meter providers
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;
            (Some(tracer_provider), meter_provider)
        } else {
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(
                Config::default()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(resource.clone()),
            )
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
            .build())
    }

    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match &self.tracer_provider {
            Some(tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Flush spans and stop the metric reader
    pub fn shutdown(&self) -> Result<(), OtelError> {
        self.meter_provider
            .shutdown()
            .map_err(|e| OtelError::Shutdown(format!("Meter shutdown failed: {:?}", e)))?;

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                result.map_err(|e| OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)))?;
            }
        }
        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Instruments for the sync engine
pub struct SyncMetrics {
    pub upstream_requests: Counter<u64>,
    pub upstream_retries: Counter<u64>,
    pub breaker_rejections: Counter<u64>,
    pub pages_fetched: Counter<u64>,
    pub rows_upserted: Counter<u64>,
    pub entity_failures: Counter<u64>,
    pub dlq_enqueued: Counter<u64>,
    pub run_duration: Histogram<f64>,
}

impl SyncMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            upstream_requests: meter
                .u64_counter("property_sync_upstream_requests_total")
                .with_description("Upstream calls by outcome class")
                .init(),
            upstream_retries: meter
                .u64_counter("property_sync_upstream_retries_total")
                .with_description("Retries spent on upstream calls")
                .init(),
            breaker_rejections: meter
                .u64_counter("property_sync_breaker_rejections_total")
                .with_description("Calls refused by the open circuit breaker")
                .init(),
            pages_fetched: meter
                .u64_counter("property_sync_pages_total")
                .with_description("Pages fetched per entity")
                .init(),
            rows_upserted: meter
                .u64_counter("property_sync_rows_upserted_total")
                .with_description("Rows written per entity")
                .init(),
            entity_failures: meter
                .u64_counter("property_sync_entity_failures_total")
                .with_description("Entity syncs that ended in an error")
                .init(),
            dlq_enqueued: meter
                .u64_counter("property_sync_dlq_enqueued_total")
                .with_description("Items sent to the dead letter queue")
                .init(),
            run_duration: meter
                .f64_histogram("property_sync_run_duration_seconds")
                .with_description("Wall time of completed sync runs")
                .init(),
        }
    }

    /// `class` is `2xx`, `4xx`, `429`, `5xx`, `timeout` or `network`
    pub fn record_upstream_request(&self, class: &'static str) {
        self.upstream_requests
            .add(1, &[KeyValue::new("class", class)]);
    }

    pub fn record_retries(&self, retries: u64) {
        if retries > 0 {
            self.upstream_retries.add(retries, &[]);
        }
    }

    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections.add(1, &[]);
    }

    pub fn record_page(&self, entity: EntityKind) {
        self.pages_fetched
            .add(1, &[KeyValue::new("entity", entity.as_str())]);
    }

    pub fn record_rows_upserted(&self, entity: EntityKind, rows: u64) {
        self.rows_upserted
            .add(rows, &[KeyValue::new("entity", entity.as_str())]);
    }

    pub fn record_entity_failure(&self, entity: EntityKind) {
        self.entity_failures
            .add(1, &[KeyValue::new("entity", entity.as_str())]);
    }

    pub fn record_dlq_enqueue(&self, entity: EntityKind) {
        self.dlq_enqueued
            .add(1, &[KeyValue::new("entity", entity.as_str())]);
    }

    pub fn record_run(&self, mode: SyncMode, duration_ms: i64, success: bool) {
        self.run_duration.record(
            duration_ms.max(0) as f64 / 1000.0,
            &[
                KeyValue::new("mode", mode.to_string()),
                KeyValue::new("success", success),
            ],
        );
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber
///
/// JSON lines unless `logging.format` is `pretty`; spans go to OTLP when
/// the provider is enabled.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(parse_level(&logging.level));
    let json = !logging.format.eq_ignore_ascii_case("pretty");

    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("property-sync")));

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
