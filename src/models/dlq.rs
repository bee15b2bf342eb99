//! Dead letter queue and audit models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityKind, SyncMode};

/// Context captured when an entity sync fails, enough to replay it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub run_id: String,
    pub mode: SyncMode,
    /// Lower bound the failed fetch used; `None` for full runs
    pub since: Option<DateTime<Utc>>,
    /// Last page fetched before the failure, if any
    pub page: Option<u32>,
}

/// An unrecoverable entity failure awaiting reprocessing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: String,
    pub entity: EntityKind,
    pub error: String,
    pub payload: FailureContext,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl DlqItem {
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Database ID (set after insertion)
    pub id: Option<i64>,
    pub event_type: String,
    pub ref_table: String,
    pub ref_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        ref_table: impl Into<String>,
        ref_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            ref_table: ref_table.into(),
            ref_id: ref_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Exhaustion compares retry count against the item's own limit
    #[test]
    fn test_dlq_item_exhausted() {
        let mut item = DlqItem {
            id: "x".to_string(),
            entity: EntityKind::Tenants,
            error: "HTTP 400".to_string(),
            payload: FailureContext {
                run_id: "r".to_string(),
                mode: SyncMode::Full,
                since: None,
                page: None,
            },
            enqueued_at: Utc::now(),
            retry_count: 4,
            max_retries: 5,
            last_attempt_at: None,
        };
        assert!(!item.is_exhausted());
        item.retry_count = 5;
        assert!(item.is_exhausted());
    }

    // Test 2: Audit event constructor stamps creation time
    #[test]
    fn test_audit_event_new() {
        let before = Utc::now();
        let event = AuditEvent::new(
            "sync.started",
            "sync_runs",
            "r1",
            serde_json::json!({"mode": "full"}),
        );
        assert_eq!(event.id, None);
        assert_eq!(event.event_type, "sync.started");
        assert!(event.created_at >= before);
    }
}
