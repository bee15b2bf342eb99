//! Sync run, request and lease models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::EntityKind;

/// How much of the upstream dataset a run fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Only records changed since the entity's cursor
    Incremental,
    /// The whole upstream dataset
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Incremental => write!(f, "incremental"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(SyncMode::Incremental),
            "full" => Ok(SyncMode::Full),
            _ => Err(format!("Invalid sync mode: {}", s)),
        }
    }
}

/// Operator or scheduler request to start a run
///
/// Every field is optional; omitted fields fall back to the configured
/// entity list, automatic mode selection and per-entity cursors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub entities: Option<Vec<EntityKind>>,
    pub mode: Option<SyncMode>,
    pub dry_run: bool,
    pub since: Option<DateTime<Utc>>,
}

/// Outcome of one entity inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    pub entity: EntityKind,
    pub fetched: u64,
    pub upserted: u64,
    pub pages: u32,
    pub error: Option<String>,
}

impl EntityResult {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            fetched: 0,
            upserted: 0,
            pages: 0,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A single orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub entities: Vec<EntityKind>,
    pub mode: SyncMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<EntityResult>,
    /// Run-level failure, distinct from per-entity errors
    pub error: Option<String>,
}

impl SyncRun {
    pub fn new(
        id: impl Into<String>,
        entities: Vec<EntityKind>,
        mode: SyncMode,
        dry_run: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entities,
            mode,
            dry_run,
            started_at,
            finished_at: None,
            results: Vec::new(),
            error: None,
        }
    }

    pub fn total_fetched(&self) -> u64 {
        self.results.iter().map(|r| r.fetched).sum()
    }

    pub fn total_upserted(&self) -> u64 {
        self.results.iter().map(|r| r.upserted).sum()
    }

    pub fn failed_entities(&self) -> Vec<EntityKind> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.entity)
            .collect()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|f| (f - self.started_at).num_milliseconds())
    }

    pub fn result_for(&self, entity: EntityKind) -> Option<&EntityResult> {
        self.results.iter().find(|r| r.entity == entity)
    }
}

/// What the orchestrator did with a run request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    /// The run executed (entities may still have failed individually)
    Completed(SyncRun),
    /// Another holder owns the lease
    Skipped { holder: String },
}

/// Persisted advisory lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl LockRecord {
    /// A lease is held while its age is strictly below its TTL
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        now - self.acquired_at < Duration::seconds(self.ttl_secs)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + Duration::seconds(self.ttl_secs)
    }
}
