//! Property data synchronization
//!
//! # Components
//!
//! - [`http_client`]: resilient upstream client (timeout, retry, circuit breaker, rate-limit parsing)
//! - [`paginator`]: page-by-page ingestion with adaptive pacing
//! - [`mappers`]: upstream records to canonical rows, plus idempotent upsert
//! - [`orchestrator`]: mode selection, advisory lease, per-entity cursors, failure isolation
//! - [`scheduler`]: fixed-interval driver and manual run channel
//! - [`dlq`]: persistent dead letter queue with bounded requeue
//! - [`progress`]: progress event fan-out and live status
//!
//! # Example
//!
//! ```ignore
//! use property_sync::sync::{EngineOptions, SyncEngine};
//! use property_sync::models::RunRequest;
//!
//! let engine = SyncEngine::build(&config, db, EngineOptions::default())?;
//! let outcome = engine.orchestrator.run(RunRequest::default()).await?;
//! ```

pub mod breaker;
pub mod cursor;
pub mod dlq;
pub mod engine;
pub mod http_client;
pub mod id;
pub mod lock;
pub mod mappers;
pub mod orchestrator;
pub mod paginator;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;

pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use cursor::CursorStore;
pub use dlq::{DeadLetterQueue, Reprocessor, RequeueOutcome, RequeueSummary};
pub use engine::{EngineOptions, SyncEngine};
pub use http_client::{ApiResponse, CallOptions, ResilientClient};
pub use lock::{LockAcquisition, SyncLock};
pub use mappers::{EntityMappers, Geocoder, MapperOutcome};
pub use orchestrator::{select_mode, EntitySyncer, SyncOrchestrator};
pub use paginator::{Page, PageStream, Paginator};
pub use progress::ProgressBus;
pub use rate_limit::RateLimitSnapshot;
pub use retry::RetryManager;
pub use scheduler::{ManualRunHandle, SchedulerConfig, SchedulerStatus, SyncRunner, SyncScheduler};
