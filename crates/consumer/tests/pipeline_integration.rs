//! Outbox to relay to consumer, with the relay replaying a publish it had
//! already made. The handler's effect must be applied once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use broker::{Broker, InMemoryBroker, InMemoryStreams, QueueSpec, Topology};
use consumer::{ConsumerSettings, EventHandler, HandlerError, IdempotentConsumer};
use outbox::{
    AggregateId, DocumentStore, EventEnvelope, OutboxError, OutboxEvent, OutboxRecord,
    OutboxStatus,
};
use relay::{RelayPublisher, RelaySettings, RoutingConfig, RoutingTable, Sinks};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    deductions: u32,
}

/// Deducts stock once per event by writing a document.
struct StockHandler {
    store: DocumentStore,
}

#[async_trait]
impl EventHandler for StockHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let id = envelope.aggregate_id.to_string();
        self.store
            .transaction(|session| {
                let mut ledger: Ledger = session.get("stock", &id)?.unwrap_or_default();
                ledger.deductions += 1;
                session.put("stock", &id, &ledger)
            })
            .await
            .map_err(|e: OutboxError| HandlerError::transient(e.to_string()))
    }
}

#[tokio::test]
async fn replayed_publish_is_applied_once() {
    let outbox = DocumentStore::new();
    let broker = InMemoryBroker::new();
    let queue = QueueSpec::new("inventory.order-events").bind("order", "order.initiated");
    broker
        .declare(&Topology::new().exchange("order").queue(queue.clone()))
        .await
        .unwrap();

    outbox
        .write_with_outbox(
            OutboxEvent::new(
                AggregateId::from_string("order-1"),
                "Order",
                "order.initiated",
                &serde_json::json!({"orderId": "order-1"}),
            )
            .unwrap(),
            |_| Ok::<_, OutboxError>(()),
        )
        .await
        .unwrap();

    let routing = RoutingTable::from_config(RoutingConfig::by_domain(["order.initiated"])).unwrap();
    let mut relay = RelayPublisher::new(
        outbox.clone(),
        Sinks::new(Arc::new(broker.clone()), Arc::new(InMemoryStreams::new()), None),
        Arc::new(routing),
        RelaySettings::default(),
    );
    relay.sync_once().await.unwrap();

    // The relay crashed after publishing but before marking: the same record
    // goes out again with the same message id.
    let published = broker.published().await;
    assert_eq!(published.len(), 1);
    broker
        .publish(
            &published[0].exchange,
            &published[0].routing_key,
            published[0].payload.clone(),
            published[0].headers.clone(),
        )
        .await
        .unwrap();

    let inventory = DocumentStore::new();
    let handler = StockHandler {
        store: inventory.clone(),
    };
    let consumer = IdempotentConsumer::new(
        Arc::new(broker.clone()),
        inventory.clone(),
        ConsumerSettings::default(),
    );
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let spec = queue.clone();
    let task = tokio::spawn(async move { consumer.consume(&spec, &handler, token).await });

    let deadline = Instant::now() + Duration::from_secs(5);
    while broker.queue_depth(&queue.name).await > 0 || broker.unacked_count(&queue.name).await > 0 {
        assert!(Instant::now() < deadline, "queue not drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.duplicates, 1);
    let ledger: Ledger = inventory.get("stock", "order-1").await.unwrap().unwrap();
    assert_eq!(ledger.deductions, 1);

    let records: Vec<OutboxRecord> = outbox.outbox_records().await;
    assert_eq!(records[0].status, OutboxStatus::Processed);
}
