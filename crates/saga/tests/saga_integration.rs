//! End-to-end fulfillment runs: orders placed through the outbox, relayed to
//! the in-memory broker, and consumed by the saga, inventory and payment
//! services sharing one document store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{Broker, InMemoryBroker, InMemoryStreams, MESSAGE_ID_HEADER, Topology};
use consumer::{ConsumeSummary, ConsumerSettings, IdempotentConsumer};
use outbox::{AggregateId, DocumentStore, OutboxStore};
use relay::{RelayPublisher, RelaySettings, RoutingTable, Sinks};
use saga::events::{INVENTORY_RESERVED, INVENTORY_RESTORED, ORDER_CREATED, ORDER_FAILED};
use saga::{
    InMemoryPaymentGateway, InventoryService, Money, Order, OrderItem, OrderSaga, OrderService,
    OrderStatus, PaymentService, PaymentStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const QUEUES: [&str; 3] = [
    "saga.order-events",
    "inventory.order-events",
    "payment.order-events",
];

fn routing_path() -> String {
    format!("{}/../../config/routing.toml", env!("CARGO_MANIFEST_DIR"))
}

struct Pipeline {
    store: DocumentStore,
    broker: InMemoryBroker,
    streams: InMemoryStreams,
    gateway: InMemoryPaymentGateway,
    orders: OrderService<DocumentStore>,
    inventory: InventoryService,
    payments: PaymentService,
    relay: RelayPublisher<DocumentStore>,
    shutdown: CancellationToken,
    consumed: Vec<String>,
    tasks: Vec<JoinHandle<consumer::Result<ConsumeSummary>>>,
}

impl Pipeline {
    async fn start(stock: i64) -> Self {
        Self::start_with(stock, true).await
    }

    /// Starts the relay and the consumers. Without the payment consumer
    /// orders stop at CREATED.
    async fn start_with(stock: i64, with_payment: bool) -> Self {
        let store = DocumentStore::new();
        let broker = InMemoryBroker::new();
        broker.declare(&Topology::fulfillment()).await.unwrap();

        let streams = InMemoryStreams::new();
        let routing = RoutingTable::load(routing_path()).unwrap();
        let sinks = Sinks::new(
            Arc::new(broker.clone()),
            Arc::new(streams.clone()),
            routing.stream_maxlen(),
        );
        let relay = RelayPublisher::new(
            store.clone(),
            sinks,
            Arc::new(routing),
            RelaySettings::default(),
        );

        let gateway = InMemoryPaymentGateway::new();
        let inventory = InventoryService::new(store.clone());
        inventory.seed_stock("P1", stock).await.unwrap();
        let payments = PaymentService::new(store.clone(), Arc::new(gateway.clone()));

        let mut pipeline = Self {
            orders: OrderService::new(store.clone()),
            store,
            broker,
            streams,
            gateway,
            inventory,
            payments,
            relay,
            shutdown: CancellationToken::new(),
            consumed: Vec::new(),
            tasks: Vec::new(),
        };

        let saga = OrderSaga::new(pipeline.store.clone());
        pipeline.spawn("saga.order-events", saga);
        pipeline.spawn("inventory.order-events", pipeline.inventory.clone());
        if with_payment {
            pipeline.spawn("payment.order-events", pipeline.payments.clone());
        }
        pipeline
    }

    fn spawn<H>(&mut self, queue: &str, handler: H)
    where
        H: consumer::EventHandler + 'static,
    {
        let spec = Topology::fulfillment().find_queue(queue).unwrap().clone();
        let consumer = IdempotentConsumer::new(
            Arc::new(self.broker.clone()),
            self.store.clone(),
            ConsumerSettings::default(),
        );
        let token = self.shutdown.clone();
        self.consumed.push(spec.name.clone());
        self.tasks.push(tokio::spawn(async move {
            consumer.consume(&spec, &handler, token).await
        }));
    }

    async fn idle(&self) -> bool {
        if self.store.stats().await.unwrap().pending > 0 {
            return false;
        }
        for queue in &self.consumed {
            if self.broker.queue_depth(queue).await > 0 || self.broker.unacked_count(queue).await > 0
            {
                return false;
            }
        }
        true
    }

    /// Relays until every order satisfies `done` and nothing is in flight.
    async fn settle(&mut self, ids: &[AggregateId], done: impl Fn(&Order) -> bool) -> Vec<Order> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            self.relay.sync_once().await.unwrap();

            let mut orders = Vec::with_capacity(ids.len());
            for id in ids {
                orders.push(self.orders.get_order(id).await.unwrap().unwrap());
            }
            if orders.iter().all(&done) && self.idle().await {
                return orders;
            }

            assert!(Instant::now() < deadline, "pipeline did not settle: {orders:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn settle_terminal(&mut self, id: &AggregateId) -> Order {
        self.settle(std::slice::from_ref(id), |o| o.status.is_terminal())
            .await
            .remove(0)
    }

    async fn event_count(&self, id: &AggregateId, event_type: &str) -> usize {
        self.store
            .events_for_aggregate(id)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.event_type == event_type)
            .count()
    }

    async fn stop(self) -> Vec<ConsumeSummary> {
        self.shutdown.cancel();
        let mut summaries = Vec::new();
        for task in self.tasks {
            summaries.push(task.await.unwrap().unwrap());
        }
        summaries
    }
}

fn two_of_p1() -> Vec<OrderItem> {
    vec![OrderItem::new("P1", 2, Money::from_cents(1000))]
}

#[tokio::test]
async fn successful_order_is_placed() {
    let mut pipeline = Pipeline::start(10).await;

    let order = pipeline
        .orders
        .place_order("user-1", two_of_p1())
        .await
        .unwrap();
    let settled = pipeline.settle_terminal(&order.id).await;

    assert_eq!(settled.status, OrderStatus::Placed);
    assert_eq!(settled.failure_reason, None);
    assert_eq!(pipeline.inventory.stock("P1").await.unwrap(), Some(8));
    assert_eq!(pipeline.gateway.captured_count().await, 1);

    let payment = pipeline.payments.find_payment(&order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.amount, Money::from_cents(2000));

    // order.placed is also appended to the orders stream.
    assert_eq!(pipeline.streams.len("orders-stream").await, 1);
    pipeline.stop().await;
}

#[tokio::test]
async fn declined_payment_fails_order_and_restores_stock() {
    let mut pipeline = Pipeline::start(10).await;
    pipeline.gateway.decline_with(Some("declined")).await;

    let order = pipeline
        .orders
        .place_order("user-1", two_of_p1())
        .await
        .unwrap();
    let settled = pipeline.settle_terminal(&order.id).await;

    assert_eq!(settled.status, OrderStatus::Failed);
    assert_eq!(settled.failure_reason.as_deref(), Some("declined"));
    assert_eq!(pipeline.inventory.stock("P1").await.unwrap(), Some(10));
    assert_eq!(pipeline.event_count(&order.id, INVENTORY_RESTORED).await, 1);

    let payment = pipeline.payments.find_payment(&order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    pipeline.stop().await;
}

#[tokio::test]
async fn insufficient_stock_fails_order_without_charging() {
    let mut pipeline = Pipeline::start(1).await;

    let order = pipeline
        .orders
        .place_order("user-1", two_of_p1())
        .await
        .unwrap();
    let settled = pipeline.settle_terminal(&order.id).await;

    assert_eq!(settled.status, OrderStatus::Failed);
    assert!(
        settled
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("insufficient stock")),
        "{settled:?}"
    );
    assert_eq!(pipeline.inventory.stock("P1").await.unwrap(), Some(1));
    assert_eq!(pipeline.gateway.charge_calls().await, 0);

    // The failed order leaves a marker so a late order.created cannot charge.
    let marker = pipeline.payments.find_payment(&order.id).await.unwrap().unwrap();
    assert_eq!(marker.status, PaymentStatus::Cancelled);
    pipeline.stop().await;
}

#[tokio::test]
async fn redelivered_reservation_leaves_created_order_alone() {
    let mut pipeline = Pipeline::start_with(10, false).await;

    let order = pipeline
        .orders
        .place_order("user-1", two_of_p1())
        .await
        .unwrap();
    pipeline
        .settle(std::slice::from_ref(&order.id), |o| o.status == OrderStatus::Created)
        .await;

    // Replay the reservation under fresh message ids so the ledger cannot
    // catch it and the status guard has to.
    let reserved = pipeline
        .broker
        .published()
        .await
        .into_iter()
        .find(|p| p.routing_key == INVENTORY_RESERVED)
        .unwrap();
    for replay in ["replay-1", "replay-2"] {
        let mut headers = reserved.headers.clone();
        headers.insert(MESSAGE_ID_HEADER.to_string(), replay.to_string());
        pipeline
            .broker
            .publish(
                &reserved.exchange,
                &reserved.routing_key,
                reserved.payload.clone(),
                headers,
            )
            .await
            .unwrap();
    }

    let settled = pipeline
        .settle(std::slice::from_ref(&order.id), |o| o.status == OrderStatus::Created)
        .await;
    assert_eq!(settled[0].status, OrderStatus::Created);
    assert_eq!(pipeline.event_count(&order.id, ORDER_CREATED).await, 1);
    assert_eq!(pipeline.inventory.stock("P1").await.unwrap(), Some(8));

    let summaries = pipeline.stop().await;
    let saga = &summaries[0];
    assert_eq!(saga.duplicates, 0);
    assert!(saga.processed >= 3);
}

#[tokio::test]
async fn competing_orders_split_limited_stock() {
    let mut pipeline = Pipeline::start(6).await;

    let mut ids = Vec::new();
    for user in 0..5 {
        let order = pipeline
            .orders
            .place_order(&format!("user-{user}"), two_of_p1())
            .await
            .unwrap();
        ids.push(order.id);
    }
    let settled = pipeline.settle(&ids, |o| o.status.is_terminal()).await;

    let placed = settled
        .iter()
        .filter(|o| o.status == OrderStatus::Placed)
        .count();
    let failed = settled
        .iter()
        .filter(|o| o.status == OrderStatus::Failed)
        .count();
    assert_eq!((placed, failed), (3, 2));
    assert_eq!(pipeline.inventory.stock("P1").await.unwrap(), Some(0));
    assert_eq!(pipeline.gateway.captured_count().await, 3);

    for order in settled.iter().filter(|o| o.status == OrderStatus::Failed) {
        assert_eq!(pipeline.event_count(&order.id, ORDER_FAILED).await, 1);
    }
    for queue in QUEUES {
        let dlq = format!("{queue}.dlq");
        assert!(pipeline.broker.dead_letters(&dlq).await.is_empty(), "{dlq}");
    }
    pipeline.stop().await;
}
