use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, EventEnvelope, OutboxError, Result};

/// Delivery status of an outbox record.
///
/// ```text
/// PENDING ──┬──► PROCESSED
///           └──► FAILED
/// ```
///
/// Both terminal states are final; a record never returns to PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    /// Returns true for PROCESSED and FAILED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }

    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    /// Parses the stored representation.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry budget and retention applied to newly written records.
#[derive(Debug, Clone, Copy)]
pub struct OutboxPolicy {
    /// Publish attempts allowed before a record is marked FAILED.
    pub max_retries: i32,
    /// Lifetime of a record; `expire_at = created_at + ttl`.
    pub ttl: Duration,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            ttl: Duration::days(7),
        }
    }
}

/// Descriptor of an event to be written alongside a domain mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    /// JSON-encoded payload.
    pub payload: String,
}

impl OutboxEvent {
    /// Creates an event descriptor, serializing the payload to JSON.
    pub fn new<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload: serde_json::to_string(payload)?,
        })
    }

    /// Creates an event descriptor from an already-encoded payload.
    pub fn raw(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}

/// A persisted outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub expire_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Builds a fresh PENDING record for an event.
    pub fn pending(event: OutboxEvent, policy: &OutboxPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            event_type: event.event_type,
            payload: event.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: policy.max_retries,
            created_at: now,
            processed_at: None,
            expire_at: now + policy.ttl,
        }
    }

    /// Returns true once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Returns true if the relay may still pick this record up.
    pub fn is_publishable(&self) -> bool {
        self.status == OutboxStatus::Pending && !self.retries_exhausted()
    }

    /// Returns true if the record's TTL has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }

    /// Builds the wire envelope with the payload decoded.
    pub fn to_envelope(&self) -> Result<EventEnvelope> {
        Ok(EventEnvelope {
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event_type: self.event_type.clone(),
            payload: serde_json::from_str(&self.payload)?,
            timestamp: self.created_at,
        })
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processed + self.failed
    }
}

/// Retry counter of a record after a failed publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub id: Uuid,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl RetryState {
    /// Returns true if the record must now be marked FAILED.
    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Result of a write performed together with an outbox record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    /// Both the mutation and the outbox record were committed.
    Committed(T),
    /// An outbox record with the same idempotency key already existed;
    /// nothing was written.
    Skipped,
}

impl<T> WriteOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, WriteOutcome::Skipped)
    }

    /// Returns the committed value, if any.
    pub fn committed(self) -> Option<T> {
        match self {
            WriteOutcome::Committed(value) => Some(value),
            WriteOutcome::Skipped => None,
        }
    }
}
