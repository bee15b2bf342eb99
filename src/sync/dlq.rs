//! Dead letter queue for failed entity syncs
//!
//! Items live in the database so they survive restarts. A requeue replays
//! the captured failure context through a [`Reprocessor`] with its own
//! short retry loop (whole-second exponential backoff). Success deletes the
//! item; exhaustion writes it back with `retry_count + 1` and the latest
//! error. Items that already used up `max_retries` are refused.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::id::generate_id;
use crate::config::DlqConfig;
use crate::database::Database;
use crate::error::{DlqError, SyncError};
use crate::models::{AuditEvent, DlqItem, EntityKind, EntityResult, FailureContext};
use crate::otel::SyncMetrics;

/// Audit table name for DLQ events
pub const DLQ_REF_TABLE: &str = "dlq_items";

/// Replays a failed entity sync from its captured context
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reprocessor: Send + Sync {
    async fn reprocess(
        &self,
        entity: EntityKind,
        context: &FailureContext,
    ) -> Result<EntityResult, SyncError>;
}

/// Result of requeuing one item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RequeueOutcome {
    /// Reprocessing succeeded and the item was removed
    Succeeded { id: String, result: EntityResult },
    /// Every attempt failed; the item stays queued with updated counters
    Failed { item: DlqItem },
}

/// Totals for a bulk requeue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequeueSummary {
    pub succeeded: u32,
    pub failed: u32,
    /// Items skipped because their retries were exhausted
    pub skipped: u32,
}

/// Persistent dead letter queue
pub struct DeadLetterQueue<D: Database> {
    db: Arc<D>,
    reprocessor: Arc<dyn Reprocessor>,
    config: DlqConfig,
    metrics: Option<Arc<SyncMetrics>>,
}

impl<D: Database> DeadLetterQueue<D> {
    pub fn new(db: Arc<D>, reprocessor: Arc<dyn Reprocessor>, config: DlqConfig) -> Self {
        Self {
            db,
            reprocessor,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append a failure with `retry_count = 0`
    pub async fn enqueue(
        &self,
        entity: EntityKind,
        error: &str,
        payload: FailureContext,
    ) -> Result<DlqItem, DlqError> {
        let item = DlqItem {
            id: generate_id(),
            entity,
            error: error.to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: self.config.max_retries,
            last_attempt_at: None,
        };
        self.db.insert_dlq_item(&item).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_dlq_enqueue(entity);
        }
        warn!(
            dlq_id = %item.id,
            entity = %entity,
            run_id = %item.payload.run_id,
            error = %error,
            "Entity failure sent to DLQ"
        );
        Ok(item)
    }

    pub async fn list(&self) -> Result<Vec<DlqItem>, DlqError> {
        Ok(self.db.list_dlq_items().await?)
    }

    pub async fn get(&self, id: &str) -> Result<DlqItem, DlqError> {
        self.db
            .get_dlq_item(id)
            .await?
            .ok_or_else(|| DlqError::NotFound(id.to_string()))
    }

    /// Reprocess one item
    pub async fn requeue(&self, id: &str) -> Result<RequeueOutcome, DlqError> {
        let item = self.get(id).await?;
        if item.is_exhausted() {
            return Err(DlqError::RetriesExhausted {
                id: item.id,
                retry_count: item.retry_count,
                max_retries: item.max_retries,
            });
        }
        self.reprocess_item(item).await
    }

    /// Requeue every item in enqueue order, skipping exhausted ones
    pub async fn requeue_all(&self) -> Result<RequeueSummary, DlqError> {
        let mut summary = RequeueSummary::default();

        for item in self.db.list_dlq_items().await? {
            if item.is_exhausted() {
                debug!(dlq_id = %item.id, "Skipping exhausted DLQ item");
                summary.skipped += 1;
                continue;
            }
            match self.reprocess_item(item).await? {
                RequeueOutcome::Succeeded { .. } => summary.succeeded += 1,
                RequeueOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Bulk DLQ requeue finished"
        );
        Ok(summary)
    }

    pub async fn delete(&self, id: &str) -> Result<(), DlqError> {
        if self.db.delete_dlq_item(id).await? {
            info!(dlq_id = %id, "DLQ item deleted");
            Ok(())
        } else {
            Err(DlqError::NotFound(id.to_string()))
        }
    }

    /// Remove every item unconditionally
    pub async fn clear_all(&self) -> Result<u64, DlqError> {
        let removed = self.db.clear_dlq().await?;
        warn!(removed = removed, "DLQ cleared");
        self.audit(
            "dlq.cleared",
            "*",
            serde_json::json!({ "removed": removed }),
        )
        .await;
        Ok(removed)
    }

    async fn reprocess_item(&self, mut item: DlqItem) -> Result<RequeueOutcome, DlqError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = item.error.clone();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff(attempt - 1);
                debug!(
                    dlq_id = %item.id,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    "Waiting before next DLQ attempt"
                );
                tokio::time::sleep(delay).await;
            }

            match self.reprocessor.reprocess(item.entity, &item.payload).await {
                Ok(result) => {
                    self.db.delete_dlq_item(&item.id).await?;
                    info!(
                        dlq_id = %item.id,
                        entity = %item.entity,
                        fetched = result.fetched,
                        upserted = result.upserted,
                        "DLQ item reprocessed"
                    );
                    self.audit(
                        "dlq.requeued",
                        &item.id,
                        serde_json::json!({
                            "entity": item.entity,
                            "fetched": result.fetched,
                            "upserted": result.upserted,
                        }),
                    )
                    .await;
                    return Ok(RequeueOutcome::Succeeded {
                        id: item.id,
                        result,
                    });
                }
                Err(e) => {
                    debug!(dlq_id = %item.id, attempt = attempt + 1, error = %e, "DLQ attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        item.retry_count += 1;
        item.error = last_error;
        item.last_attempt_at = Some(Utc::now());
        self.db.update_dlq_item(&item).await?;

        warn!(
            dlq_id = %item.id,
            entity = %item.entity,
            retry_count = item.retry_count,
            max_retries = item.max_retries,
            error = %item.error,
            "DLQ requeue failed"
        );
        self.audit(
            "dlq.requeue_failed",
            &item.id,
            serde_json::json!({
                "entity": item.entity,
                "retryCount": item.retry_count,
                "error": item.error,
            }),
        )
        .await;

        Ok(RequeueOutcome::Failed { item })
    }

    /// `backoff_base_secs * 2^n` whole seconds
    fn backoff(&self, n: u32) -> Duration {
        let factor = 1u64.checked_shl(n).unwrap_or(u64::MAX);
        Duration::from_secs(self.config.backoff_base_secs.saturating_mul(factor))
    }

    async fn audit(&self, event_type: &str, ref_id: &str, payload: serde_json::Value) {
        let event = AuditEvent::new(event_type, DLQ_REF_TABLE, ref_id, payload);
        if let Err(e) = self.db.append_audit(&event).await {
            warn!(event_type = event_type, error = %e, "Failed to write audit event");
        }
    }
}
