//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::migrations::CREATE_SCHEMA;
use super::Database;
use crate::error::DbError;
use crate::models::{
    AuditEvent, DlqItem, EntityKind, FailureContext, LeaseRow, OwnerRow, PropertyRow, TenantRow,
    UnitRow,
};

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }
}

/// DLQ row as stored, decoded outside the connection thread
struct DlqRow {
    id: String,
    entity: String,
    error: String,
    payload: String,
    enqueued_at: String,
    retry_count: i64,
    max_retries: i64,
    last_attempt_at: Option<String>,
}

impl DlqRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity: row.get(1)?,
            error: row.get(2)?,
            payload: row.get(3)?,
            enqueued_at: row.get(4)?,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            last_attempt_at: row.get(7)?,
        })
    }

    fn into_item(self) -> Result<DlqItem, DbError> {
        let entity: EntityKind = self.entity.parse().map_err(DbError::Serialization)?;
        let payload: FailureContext = serde_json::from_str(&self.payload)?;
        let enqueued_at = parse_datetime(Some(self.enqueued_at))
            .ok_or_else(|| DbError::Serialization("invalid enqueued_at".to_string()))?;

        Ok(DlqItem {
            id: self.id,
            entity,
            error: self.error,
            payload,
            enqueued_at,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            last_attempt_at: parse_datetime(self.last_attempt_at),
        })
    }
}

const DLQ_COLUMNS: &str =
    "id, entity, error, payload, enqueued_at, retry_count, max_retries, last_attempt_at";

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Key/value state
    // =========================================================================

    async fn get_state(&self, key: &str) -> Result<Option<String>, DbError> {
        let key = key.to_string();

        self.conn
            .call(move |conn| {
                let value: Option<String> = conn
                    .query_row(
                        "SELECT value FROM sync_state WHERE key = ?1",
                        [&key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
            .map_err(Into::into)
    }

    async fn put_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sync_state (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                    "#,
                    rusqlite::params![key, value, now],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn delete_state(&self, key: &str) -> Result<bool, DbError> {
        let key = key.to_string();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM sync_state WHERE key = ?1", [&key])?;
                Ok(count)
            })
            .await?;

        Ok(rows_affected > 0)
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    async fn append_audit(&self, event: &AuditEvent) -> Result<i64, DbError> {
        let event_type = event.event_type.clone();
        let ref_table = event.ref_table.clone();
        let ref_id = event.ref_id.clone();
        let payload = serde_json::to_string(&event.payload)?;
        let created_at = event.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO audit_log (event_type, ref_table, ref_id, payload, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    rusqlite::params![event_type, ref_table, ref_id, payload, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    async fn list_audit(&self, ref_table: &str, limit: u32) -> Result<Vec<AuditEvent>, DbError> {
        let ref_table = ref_table.to_string();

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, event_type, ref_table, ref_id, payload, created_at
                    FROM audit_log
                    WHERE ref_table = ?1
                    ORDER BY id DESC
                    LIMIT ?2
                    "#,
                )?;

                let rows = stmt
                    .query_map(rusqlite::params![ref_table, limit], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, event_type, ref_table, ref_id, payload, created_at)| {
                let payload: serde_json::Value = serde_json::from_str(&payload)?;
                Ok::<_, DbError>(AuditEvent {
                    id: Some(id),
                    event_type,
                    ref_table,
                    ref_id,
                    payload,
                    created_at: parse_datetime(created_at).unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    // =========================================================================
    // Dead letter queue
    // =========================================================================

    async fn insert_dlq_item(&self, item: &DlqItem) -> Result<(), DbError> {
        let id = item.id.clone();
        let entity = item.entity.to_string();
        let error = item.error.clone();
        let payload = serde_json::to_string(&item.payload)?;
        let enqueued_at = item.enqueued_at.to_rfc3339();
        let retry_count = item.retry_count as i64;
        let max_retries = item.max_retries as i64;
        let last_attempt_at = item.last_attempt_at.map(|dt| dt.to_rfc3339());

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO dlq_items
                    (id, entity, error, payload, enqueued_at, retry_count, max_retries, last_attempt_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    rusqlite::params![
                        id,
                        entity,
                        error,
                        payload,
                        enqueued_at,
                        retry_count,
                        max_retries,
                        last_attempt_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn get_dlq_item(&self, id: &str) -> Result<Option<DlqItem>, DbError> {
        let id = id.to_string();

        let row = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM dlq_items WHERE id = ?1", DLQ_COLUMNS);
                let row = conn.query_row(&sql, [&id], DlqRow::from_row).optional()?;
                Ok(row)
            })
            .await?;

        row.map(DlqRow::into_item).transpose()
    }

    async fn list_dlq_items(&self) -> Result<Vec<DlqItem>, DbError> {
        let rows = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "SELECT {} FROM dlq_items ORDER BY enqueued_at, id",
                    DLQ_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], DlqRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(DlqRow::into_item).collect()
    }

    async fn update_dlq_item(&self, item: &DlqItem) -> Result<(), DbError> {
        let id = item.id.clone();
        let error = item.error.clone();
        let payload = serde_json::to_string(&item.payload)?;
        let retry_count = item.retry_count as i64;
        let max_retries = item.max_retries as i64;
        let last_attempt_at = item.last_attempt_at.map(|dt| dt.to_rfc3339());

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE dlq_items
                    SET error = ?1, payload = ?2, retry_count = ?3, max_retries = ?4, last_attempt_at = ?5
                    WHERE id = ?6
                    "#,
                    rusqlite::params![error, payload, retry_count, max_retries, last_attempt_at, id],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn delete_dlq_item(&self, id: &str) -> Result<bool, DbError> {
        let id = id.to_string();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM dlq_items WHERE id = ?1", [&id])?;
                Ok(count)
            })
            .await?;

        Ok(rows_affected > 0)
    }

    async fn clear_dlq(&self) -> Result<u64, DbError> {
        self.conn
            .call(|conn| {
                let count = conn.execute("DELETE FROM dlq_items", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Entity upserts
    // =========================================================================

    async fn upsert_owners(&self, rows: &[OwnerRow]) -> Result<u64, DbError> {
        let rows = rows.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0u64;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO owners (external_id, name, email, phone, upstream_updated_at, synced_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
                        ON CONFLICT(external_id) DO UPDATE SET
                            name = excluded.name,
                            email = excluded.email,
                            phone = excluded.phone,
                            upstream_updated_at = excluded.upstream_updated_at,
                            synced_at = CURRENT_TIMESTAMP
                        "#,
                    )?;
                    for row in &rows {
                        written += stmt.execute(rusqlite::params![
                            row.external_id,
                            row.name,
                            row.email,
                            row.phone,
                            row.updated_at
                        ])? as u64;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert_properties(&self, rows: &[PropertyRow]) -> Result<u64, DbError> {
        let rows = rows.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0u64;
                {
                    // Coordinates already geocoded locally survive an upstream row without them
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO properties
                        (external_id, owner_external_id, name, address_line1, city, state, postal_code,
                         latitude, longitude, upstream_updated_at, synced_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP)
                        ON CONFLICT(external_id) DO UPDATE SET
                            owner_external_id = excluded.owner_external_id,
                            name = excluded.name,
                            address_line1 = excluded.address_line1,
                            city = excluded.city,
                            state = excluded.state,
                            postal_code = excluded.postal_code,
                            latitude = COALESCE(excluded.latitude, properties.latitude),
                            longitude = COALESCE(excluded.longitude, properties.longitude),
                            upstream_updated_at = excluded.upstream_updated_at,
                            synced_at = CURRENT_TIMESTAMP
                        "#,
                    )?;
                    for row in &rows {
                        written += stmt.execute(rusqlite::params![
                            row.external_id,
                            row.owner_external_id,
                            row.name,
                            row.address_line1,
                            row.city,
                            row.state,
                            row.postal_code,
                            row.latitude,
                            row.longitude,
                            row.updated_at
                        ])? as u64;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert_units(&self, rows: &[UnitRow]) -> Result<u64, DbError> {
        let rows = rows.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0u64;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO units
                        (external_id, property_external_id, unit_number, bedrooms, bathrooms,
                         square_feet, market_rent, upstream_updated_at, synced_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
                        ON CONFLICT(external_id) DO UPDATE SET
                            property_external_id = excluded.property_external_id,
                            unit_number = excluded.unit_number,
                            bedrooms = excluded.bedrooms,
                            bathrooms = excluded.bathrooms,
                            square_feet = excluded.square_feet,
                            market_rent = excluded.market_rent,
                            upstream_updated_at = excluded.upstream_updated_at,
                            synced_at = CURRENT_TIMESTAMP
                        "#,
                    )?;
                    for row in &rows {
                        written += stmt.execute(rusqlite::params![
                            row.external_id,
                            row.property_external_id,
                            row.unit_number,
                            row.bedrooms,
                            row.bathrooms,
                            row.square_feet,
                            row.market_rent,
                            row.updated_at
                        ])? as u64;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert_tenants(&self, rows: &[TenantRow]) -> Result<u64, DbError> {
        let rows = rows.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0u64;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO tenants
                        (external_id, first_name, last_name, email, phone, upstream_updated_at, synced_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)
                        ON CONFLICT(external_id) DO UPDATE SET
                            first_name = excluded.first_name,
                            last_name = excluded.last_name,
                            email = excluded.email,
                            phone = excluded.phone,
                            upstream_updated_at = excluded.upstream_updated_at,
                            synced_at = CURRENT_TIMESTAMP
                        "#,
                    )?;
                    for row in &rows {
                        written += stmt.execute(rusqlite::params![
                            row.external_id,
                            row.first_name,
                            row.last_name,
                            row.email,
                            row.phone,
                            row.updated_at
                        ])? as u64;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert_leases(&self, rows: &[LeaseRow]) -> Result<u64, DbError> {
        let rows = rows.to_vec();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0u64;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO leases
                        (external_id, unit_external_id, tenant_external_id, start_date, end_date,
                         rent_amount, status, upstream_updated_at, synced_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
                        ON CONFLICT(external_id) DO UPDATE SET
                            unit_external_id = excluded.unit_external_id,
                            tenant_external_id = excluded.tenant_external_id,
                            start_date = excluded.start_date,
                            end_date = excluded.end_date,
                            rent_amount = excluded.rent_amount,
                            status = excluded.status,
                            upstream_updated_at = excluded.upstream_updated_at,
                            synced_at = CURRENT_TIMESTAMP
                        "#,
                    )?;
                    for row in &rows {
                        written += stmt.execute(rusqlite::params![
                            row.external_id,
                            row.unit_external_id,
                            row.tenant_external_id,
                            row.start_date,
                            row.end_date,
                            row.rent_amount,
                            row.status,
                            row.updated_at
                        ])? as u64;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
            .map_err(Into::into)
    }

    async fn set_property_coordinates(
        &self,
        external_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), DbError> {
        let external_id = external_id.to_string();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "UPDATE properties SET latitude = ?1, longitude = ?2 WHERE external_id = ?3",
                    rusqlite::params![latitude, longitude, external_id],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn count_rows(&self, entity: EntityKind) -> Result<u64, DbError> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.table());

        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }
}

/// Parse a datetime string from SQLite
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // SQLite's CURRENT_TIMESTAMP format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}
