//! Per-entity cursors and run checkpoints
//!
//! Values are RFC 3339 timestamps in the shared key/value state. Cursors
//! only move forward: `advance` keeps the later of the stored and the new
//! value.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::database::Database;
use crate::error::DbError;
use crate::models::{EntityKind, SyncMode};

const LAST_FULL_KEY: &str = "last_full_sync_at";
const LAST_INCREMENTAL_KEY: &str = "last_incremental_sync_at";

fn cursor_key(entity: EntityKind) -> String {
    format!("cursor:{}", entity)
}

/// Cursor and checkpoint persistence
pub struct CursorStore<D: Database> {
    db: Arc<D>,
}

impl<D: Database> CursorStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub async fn cursor(&self, entity: EntityKind) -> Result<Option<DateTime<Utc>>, DbError> {
        self.read_timestamp(&cursor_key(entity)).await
    }

    /// Move the cursor forward to `to`; never moves it back
    ///
    /// Returns the stored value after the call
    pub async fn advance(
        &self,
        entity: EntityKind,
        to: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, DbError> {
        let key = cursor_key(entity);
        match self.read_timestamp(&key).await? {
            Some(current) if current >= to => Ok(current),
            _ => {
                self.db.put_state(&key, &to.to_rfc3339()).await?;
                Ok(to)
            }
        }
    }

    pub async fn last_full_sync(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        self.read_timestamp(LAST_FULL_KEY).await
    }

    pub async fn last_incremental_sync(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        self.read_timestamp(LAST_INCREMENTAL_KEY).await
    }

    /// Record that a run of `mode` completed at `at`
    pub async fn set_checkpoint(&self, mode: SyncMode, at: DateTime<Utc>) -> Result<(), DbError> {
        let key = match mode {
            SyncMode::Full => LAST_FULL_KEY,
            SyncMode::Incremental => LAST_INCREMENTAL_KEY,
        };
        self.db.put_state(key, &at.to_rfc3339()).await
    }

    async fn read_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let Some(raw) = self.db.get_state(key).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
            Err(e) => {
                warn!(key = key, value = %raw, error = %e, "Ignoring unparsable timestamp");
                Ok(None)
            }
        }
    }
}
