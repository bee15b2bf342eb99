//! Advisory sync lease stored in shared state
//!
//! A lease is a JSON `LockRecord` under one state key. It is acquired when
//! no record exists or the existing one is older than its TTL, and released
//! only by its holder. This is read-then-write, not compare-and-swap: two
//! processes racing inside the same instant can both believe they hold it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::DbError;
use crate::models::LockRecord;

/// State key holding the lease
pub const LOCK_KEY: &str = "sync_lock";

/// Result of an acquisition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquisition {
    Acquired(LockRecord),
    /// Someone else holds an unexpired lease
    Held(LockRecord),
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired(_))
    }
}

/// TTL-based advisory lock
pub struct SyncLock<D: Database> {
    db: Arc<D>,
    ttl_secs: i64,
}

impl<D: Database> SyncLock<D> {
    pub fn new(db: Arc<D>, ttl_secs: u64) -> Self {
        Self {
            db,
            ttl_secs: ttl_secs as i64,
        }
    }

    /// Current lease, if any (expired leases included)
    pub async fn current(&self) -> Result<Option<LockRecord>, DbError> {
        match self.db.get_state(LOCK_KEY).await? {
            None => Ok(None),
            Some(raw) => match serde_json::from_str::<LockRecord>(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(error = %e, "Unreadable lock record, treating as abandoned");
                    Ok(None)
                }
            },
        }
    }

    pub async fn acquire(&self, holder: &str) -> Result<LockAcquisition, DbError> {
        self.acquire_at(holder, Utc::now()).await
    }

    pub async fn acquire_at(
        &self,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition, DbError> {
        if let Some(existing) = self.current().await? {
            if existing.is_held_at(now) {
                debug!(
                    holder = %existing.holder,
                    expires_at = %existing.expires_at(),
                    "Sync lock held"
                );
                return Ok(LockAcquisition::Held(existing));
            }
            info!(
                previous_holder = %existing.holder,
                acquired_at = %existing.acquired_at,
                "Overwriting expired sync lock"
            );
        }

        let record = LockRecord {
            holder: holder.to_string(),
            acquired_at: now,
            ttl_secs: self.ttl_secs,
        };
        self.db
            .put_state(LOCK_KEY, &serde_json::to_string(&record)?)
            .await?;

        debug!(holder = %holder, ttl_secs = self.ttl_secs, "Sync lock acquired");
        Ok(LockAcquisition::Acquired(record))
    }

    /// Release the lease if `holder` still owns it
    ///
    /// Returns true if the lease was removed
    pub async fn release(&self, holder: &str) -> Result<bool, DbError> {
        match self.current().await? {
            Some(existing) if existing.holder == holder => {
                self.db.delete_state(LOCK_KEY).await?;
                debug!(holder = %holder, "Sync lock released");
                Ok(true)
            }
            Some(existing) => {
                warn!(
                    holder = %holder,
                    current_holder = %existing.holder,
                    "Sync lock taken over by another holder, not releasing"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
