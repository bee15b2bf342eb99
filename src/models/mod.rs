//! Domain models for property-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod dlq;
pub mod entity;
pub mod progress;
pub mod sync;

// Re-export commonly used types
pub use dlq::{AuditEvent, DlqItem, FailureContext};
pub use entity::{EntityKind, LeaseRow, OwnerRow, PropertyRow, TenantRow, UnitRow};
pub use progress::{LiveStatus, OrchestratorState, ProgressEvent, ProgressKind};
pub use sync::{EntityResult, LockRecord, RunOutcome, RunRequest, SyncMode, SyncRun};
