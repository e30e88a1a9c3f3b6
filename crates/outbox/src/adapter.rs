use std::str::FromStr;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::{
    AggregateId, DocumentStore, OutboxError, OutboxRecord, OutboxStats, PostgresOutboxStore,
    ProcessedMessage, ProcessedMessageStore, Result, RetryState, store::OutboxStore,
};

/// Which backend an [`OutboxAdapter`] wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Relational,
    Document,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Relational => "relational",
            AdapterKind::Document => "document",
        }
    }
}

impl FromStr for AdapterKind {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" => Ok(AdapterKind::Relational),
            "document" | "memory" => Ok(AdapterKind::Document),
            other => Err(OutboxError::UnknownAdapter(other.to_string())),
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The configured outbox backend.
///
/// The set of backends is closed; callers that need backend-specific
/// transactions match on the variant.
#[derive(Clone)]
pub enum OutboxAdapter {
    Relational(PostgresOutboxStore),
    Document(DocumentStore),
}

impl OutboxAdapter {
    pub fn kind(&self) -> AdapterKind {
        match self {
            OutboxAdapter::Relational(_) => AdapterKind::Relational,
            OutboxAdapter::Document(_) => AdapterKind::Document,
        }
    }

    fn store(&self) -> &dyn OutboxStore {
        match self {
            OutboxAdapter::Relational(store) => store,
            OutboxAdapter::Document(store) => store,
        }
    }

    fn ledger(&self) -> &dyn ProcessedMessageStore {
        match self {
            OutboxAdapter::Relational(store) => store,
            OutboxAdapter::Document(store) => store,
        }
    }
}

impl From<PostgresOutboxStore> for OutboxAdapter {
    fn from(store: PostgresOutboxStore) -> Self {
        OutboxAdapter::Relational(store)
    }
}

impl From<DocumentStore> for OutboxAdapter {
    fn from(store: DocumentStore) -> Self {
        OutboxAdapter::Document(store)
    }
}

#[async_trait]
impl OutboxStore for OutboxAdapter {
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.store().find_pending(limit).await
    }

    async fn mark_processed(&self, ids: &[Uuid]) -> Result<u64> {
        self.store().mark_processed(ids).await
    }

    async fn mark_failed(&self, ids: &[Uuid]) -> Result<u64> {
        self.store().mark_failed(ids).await
    }

    async fn increment_retry(&self, ids: &[Uuid]) -> Result<Vec<RetryState>> {
        self.store().increment_retry(ids).await
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        self.store().cleanup(retention).await
    }

    async fn stats(&self) -> Result<OutboxStats> {
        self.store().stats().await
    }

    async fn has_event(&self, aggregate_id: &AggregateId, event_type: &str) -> Result<bool> {
        self.store().has_event(aggregate_id, event_type).await
    }

    async fn events_for_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<OutboxRecord>> {
        self.store().events_for_aggregate(aggregate_id).await
    }
}

#[async_trait]
impl ProcessedMessageStore for OutboxAdapter {
    async fn is_processed(&self, message_id: &str) -> Result<bool> {
        self.ledger().is_processed(message_id).await
    }

    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool> {
        self.ledger().record_processed(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutboxEvent, WriteOutcome};

    #[test]
    fn parse_adapter_kind() {
        assert_eq!(
            "relational".parse::<AdapterKind>().unwrap(),
            AdapterKind::Relational
        );
        assert_eq!(
            " Document ".parse::<AdapterKind>().unwrap(),
            AdapterKind::Document
        );
        assert!(matches!(
            "cassandra".parse::<AdapterKind>(),
            Err(OutboxError::UnknownAdapter(_))
        ));
    }

    #[tokio::test]
    async fn document_adapter_delegates() {
        let store = DocumentStore::new();
        let adapter = OutboxAdapter::from(store.clone());
        assert_eq!(adapter.kind(), AdapterKind::Document);

        let _: WriteOutcome<()> = store
            .write_with_outbox(
                OutboxEvent::raw(AggregateId::from_string("o-1"), "Order", "order.placed", "{}"),
                |_| Ok::<_, OutboxError>(()),
            )
            .await
            .unwrap();

        let pending = adapter.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(adapter.mark_processed(&[pending[0].id]).await.unwrap(), 1);
        assert_eq!(adapter.stats().await.unwrap().processed, 1);
        assert_eq!(adapter.cleanup(Duration::hours(24)).await.unwrap(), 0);
    }
}
