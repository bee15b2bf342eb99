//! Progress events and live run status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityKind, SyncMode};

/// Kind of progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    RunStarted,
    RunSkipped,
    EntityStarted,
    Page,
    EntityCompleted,
    EntityFailed,
    DlqEnqueued,
    RunCompleted,
    RunFailed,
}

/// One observable step of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub entity: Option<EntityKind>,
    pub page: Option<u32>,
    pub rows: Option<u64>,
    pub message: String,
    #[serde(rename = "runId")]
    pub run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            page: None,
            rows: None,
            message: message.into(),
            run_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_entity(mut self, entity: EntityKind) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_page(mut self, page: u32, rows: u64) -> Self {
        self.page = Some(page);
        self.rows = Some(rows);
        self
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }
}

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    #[default]
    Idle,
    LockAcquired,
    Running,
    Finalizing,
}

/// Snapshot of the in-flight run for the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub state: OrchestratorState,
    pub run_id: Option<String>,
    pub mode: Option<SyncMode>,
    pub entity: Option<EntityKind>,
    pub page: u32,
    pub total_pages: Option<u32>,
    pub rows: u64,
    /// Rows per second for the current entity
    pub rps: f64,
    /// Estimated seconds until the current entity finishes
    pub eta_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
}
