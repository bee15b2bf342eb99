//! Database layer for property-sync
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{
    AuditEvent, DlqItem, EntityKind, LeaseRow, OwnerRow, PropertyRow, TenantRow, UnitRow,
};

/// Database trait for data persistence
///
/// The sync engine uses it as a key/value store, an append-only audit log,
/// the durable home of the dead letter queue and the destination of upserts.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Key/value state
    // =========================================================================

    /// Read a state value
    async fn get_state(&self, key: &str) -> Result<Option<String>, DbError>;

    /// Insert or overwrite a state value
    async fn put_state(&self, key: &str, value: &str) -> Result<(), DbError>;

    /// Delete a state value
    ///
    /// Returns true if a row was removed
    async fn delete_state(&self, key: &str) -> Result<bool, DbError>;

    // =========================================================================
    // Audit log
    // =========================================================================

    /// Append an audit event
    ///
    /// Returns the ID of the inserted event
    async fn append_audit(&self, event: &AuditEvent) -> Result<i64, DbError>;

    /// Most recent audit events for a reference table, newest first
    async fn list_audit(&self, ref_table: &str, limit: u32) -> Result<Vec<AuditEvent>, DbError>;

    // =========================================================================
    // Dead letter queue
    // =========================================================================

    /// Insert a DLQ item
    async fn insert_dlq_item(&self, item: &DlqItem) -> Result<(), DbError>;

    /// Get a DLQ item by ID
    async fn get_dlq_item(&self, id: &str) -> Result<Option<DlqItem>, DbError>;

    /// List all DLQ items, oldest first
    async fn list_dlq_items(&self) -> Result<Vec<DlqItem>, DbError>;

    /// Overwrite an existing DLQ item
    async fn update_dlq_item(&self, item: &DlqItem) -> Result<(), DbError>;

    /// Delete a DLQ item by ID
    ///
    /// Returns true if a row was removed
    async fn delete_dlq_item(&self, id: &str) -> Result<bool, DbError>;

    /// Delete every DLQ item
    ///
    /// Returns the number of deleted items
    async fn clear_dlq(&self) -> Result<u64, DbError>;

    // =========================================================================
    // Entity upserts
    // =========================================================================

    /// Upsert owners keyed by external id, returns rows written
    async fn upsert_owners(&self, rows: &[OwnerRow]) -> Result<u64, DbError>;

    /// Upsert properties keyed by external id, returns rows written
    async fn upsert_properties(&self, rows: &[PropertyRow]) -> Result<u64, DbError>;

    /// Upsert units keyed by external id, returns rows written
    async fn upsert_units(&self, rows: &[UnitRow]) -> Result<u64, DbError>;

    /// Upsert tenants keyed by external id, returns rows written
    async fn upsert_tenants(&self, rows: &[TenantRow]) -> Result<u64, DbError>;

    /// Upsert leases keyed by external id, returns rows written
    async fn upsert_leases(&self, rows: &[LeaseRow]) -> Result<u64, DbError>;

    /// Store geocoded coordinates for a property
    async fn set_property_coordinates(
        &self,
        external_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), DbError>;

    /// Number of stored rows for an entity
    async fn count_rows(&self, entity: EntityKind) -> Result<u64, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureContext, SyncMode};
    use chrono::Utc;

    fn sample_dlq_item(id: &str) -> DlqItem {
        DlqItem {
            id: id.to_string(),
            entity: EntityKind::Units,
            error: "Server error: HTTP 503".to_string(),
            payload: FailureContext {
                run_id: "run-1".to_string(),
                mode: SyncMode::Incremental,
                since: Some(Utc::now()),
                page: Some(3),
            },
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: 5,
            last_attempt_at: None,
        }
    }

    // Test 1: MockDatabase state round trip
    #[tokio::test]
    async fn test_mock_database_state() {
        let mut mock = MockDatabase::new();

        mock.expect_get_state()
            .withf(|key| key == "cursor:owners")
            .returning(|_| Ok(Some("2024-01-01T00:00:00Z".to_string())));
        mock.expect_put_state().returning(|_, _| Ok(()));

        let value = mock.get_state("cursor:owners").await.unwrap();
        assert_eq!(value, Some("2024-01-01T00:00:00Z".to_string()));
        assert!(mock.put_state("cursor:owners", "x").await.is_ok());
    }

    // Test 2: MockDatabase DLQ listing
    #[tokio::test]
    async fn test_mock_database_list_dlq() {
        let mut mock = MockDatabase::new();

        mock.expect_list_dlq_items()
            .returning(|| Ok(vec![sample_dlq_item("a"), sample_dlq_item("b")]));

        let items = mock.list_dlq_items().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].entity, EntityKind::Units);
    }

    // Test 3: MockDatabase surfaces storage errors
    #[tokio::test]
    async fn test_mock_database_upsert_error() {
        let mut mock = MockDatabase::new();

        mock.expect_upsert_owners()
            .returning(|_| Err(DbError::Serialization("bad row".to_string())));

        let result = mock.upsert_owners(&[]).await;
        assert!(matches!(result, Err(DbError::Serialization(_))));
    }

    // Test 4: MockDatabase audit append returns id
    #[tokio::test]
    async fn test_mock_database_append_audit() {
        let mut mock = MockDatabase::new();

        mock.expect_append_audit()
            .withf(|event| event.event_type == "sync.completed")
            .returning(|_| Ok(7));

        let event = AuditEvent::new("sync.completed", "sync_runs", "r1", serde_json::json!({}));
        assert_eq!(mock.append_audit(&event).await.unwrap(), 7);
    }
}
