use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, OutboxRecord, OutboxStats, Result, RetryState};

/// Operations the relay publisher needs from an outbox backend.
///
/// Status updates only ever move PENDING records; terminal records are
/// left untouched so a record can never revert.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` PENDING records with retry budget left,
    /// oldest first.
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Marks records PROCESSED. Returns the number of records changed.
    async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64>;

    /// Marks records FAILED. Returns the number of records changed.
    async fn mark_failed(&self, ids: &[Uuid]) -> Result<u64>;

    /// Increments the retry counter of each record and reports the new value.
    async fn increment_retry(&self, ids: &[Uuid]) -> Result<Vec<RetryState>>;

    /// Purges terminal records: PROCESSED older than `retention` and any
    /// terminal record past its `expire_at`. Backends with native expiry
    /// return 0.
    async fn cleanup(&self, retention: Duration) -> Result<u64>;

    /// Returns record counts per status.
    async fn stats(&self) -> Result<OutboxStats>;

    /// Returns true if a record of `event_type` exists for the aggregate,
    /// whatever its status.
    async fn has_event(&self, aggregate_id: &AggregateId, event_type: &str) -> Result<bool>;

    /// Returns every record for an aggregate in creation order.
    async fn events_for_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<OutboxRecord>>;
}

/// Ledger entry for a message a consumer has already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub processed_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl ProcessedMessage {
    /// Records a message as processed now, expiring after `ttl`.
    pub fn new(
        message_id: impl Into<String>,
        event_type: impl Into<String>,
        aggregate_id: AggregateId,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            event_type: event_type.into(),
            aggregate_id,
            processed_at: now,
            expire_at: now + ttl,
        }
    }
}

/// Deduplication ledger for idempotent consumers.
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    /// Returns true if the message id has been recorded.
    async fn is_processed(&self, message_id: &str) -> Result<bool>;

    /// Records a processed message.
    ///
    /// Returns false when a record for the same id already existed, which
    /// callers treat as success.
    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool>;
}

