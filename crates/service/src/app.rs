//! Wiring of the fulfillment process.

use std::sync::Arc;

use broker::{
    AppendOnlyStream, Broker, InMemoryBroker, InMemoryStreams, NatsBroker, NatsStreams, Topology,
};
use consumer::{ConsumeSummary, ConsumerSettings, EventHandler, IdempotentConsumer};
use outbox::{AdapterKind, DocumentStore, OutboxAdapter, PostgresOutboxStore};
use relay::{RelayPublisher, RelaySettings, RoutingTable, Sinks};
use saga::{
    InMemoryPaymentGateway, InventoryService, OrderSaga, OrderService, PaymentGateway,
    PaymentService,
};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Result, ServiceError};

/// JetStream stream holding every exchange.
const NATS_STREAM: &str = "FULFILLMENT";

pub const SAGA_QUEUE: &str = "saga.order-events";
pub const INVENTORY_QUEUE: &str = "inventory.order-events";
pub const PAYMENT_QUEUE: &str = "payment.order-events";

type ConsumerTask = (String, JoinHandle<consumer::Result<ConsumeSummary>>);

/// The relay publisher and the saga, inventory and payment consumers over
/// one outbox backend and one broker.
pub struct Fulfillment {
    adapter: OutboxAdapter,
    broker: Arc<dyn Broker>,
    streams: Arc<dyn AppendOnlyStream>,
    routing: Arc<RoutingTable>,
    gateway: Arc<dyn PaymentGateway>,
    relay: RelaySettings,
    consumer: ConsumerSettings,
    max_retries: u32,
}

impl Fulfillment {
    /// Connects the configured backends. Migrations run when the outbox is
    /// relational.
    pub async fn connect(config: &Config) -> Result<Self> {
        let routing = RoutingTable::load(&config.routing_config)?;

        let adapter: OutboxAdapter = match config.adapter {
            AdapterKind::Relational => {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    ServiceError::Config("relational outbox without DATABASE_URL".to_string())
                })?;
                let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
                let store = PostgresOutboxStore::new(pool);
                store.run_migrations().await?;
                store.into()
            }
            AdapterKind::Document => DocumentStore::new().into(),
        };
        if !config.is_durable() {
            tracing::warn!(
                "outbox uses the in-process document store; pending events do not survive a restart"
            );
        }

        let (broker, streams): (Arc<dyn Broker>, Arc<dyn AppendOnlyStream>) =
            match &config.nats_url {
                Some(url) => {
                    let broker = NatsBroker::connect(url, NATS_STREAM).await?;
                    let streams = NatsStreams::new(broker.client().clone());
                    (Arc::new(broker), Arc::new(streams))
                }
                None => (
                    Arc::new(InMemoryBroker::new()),
                    Arc::new(InMemoryStreams::new()),
                ),
            };

        tracing::info!(
            adapter = %adapter.kind(),
            broker = if config.nats_url.is_some() { "nats" } else { "memory" },
            rules = routing.rule_count(),
            "backends connected"
        );
        Ok(Self::new(config, adapter, broker, streams, routing))
    }

    pub fn new(
        config: &Config,
        adapter: OutboxAdapter,
        broker: Arc<dyn Broker>,
        streams: Arc<dyn AppendOnlyStream>,
        routing: RoutingTable,
    ) -> Self {
        Self {
            adapter,
            broker,
            streams,
            routing: Arc::new(routing),
            gateway: Arc::new(InMemoryPaymentGateway::new()),
            relay: config.relay.clone(),
            consumer: config.consumer.clone(),
            max_retries: config.max_retries,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn adapter(&self) -> &OutboxAdapter {
        &self.adapter
    }

    pub fn orders(&self) -> OrderService<OutboxAdapter> {
        OrderService::new(self.adapter.clone())
    }

    pub fn inventory(&self) -> InventoryService {
        InventoryService::new(self.adapter.clone())
    }

    /// The fulfillment topology with the configured redelivery limit.
    pub fn topology(&self) -> Topology {
        let mut topology = Topology::fulfillment();
        for queue in &mut topology.queues {
            queue.max_retries = self.max_retries;
        }
        topology
    }

    /// Runs until `shutdown` fires.
    ///
    /// Shutdown stops the relay first and waits for its final sync, so
    /// nothing is published once the consumers start draining. Then the
    /// consumers stop, which flushes their buffered acks. Then the broker
    /// and the database pool are closed. Events the consumers write while
    /// draining stay PENDING for the next run.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let topology = self.topology();
        self.broker.declare(&topology).await?;

        let relay_token = CancellationToken::new();
        let consumer_token = CancellationToken::new();

        let sinks = Sinks::new(
            self.broker.clone(),
            self.streams.clone(),
            self.routing.stream_maxlen(),
        );
        let relay = RelayPublisher::new(
            self.adapter.clone(),
            sinks,
            self.routing.clone(),
            self.relay.clone(),
        );
        let relay_task = tokio::spawn(relay.run(relay_token.clone()));

        let consumers = vec![
            self.spawn_consumer(
                &topology,
                SAGA_QUEUE,
                OrderSaga::new(self.adapter.clone()),
                &consumer_token,
            )?,
            self.spawn_consumer(&topology, INVENTORY_QUEUE, self.inventory(), &consumer_token)?,
            self.spawn_consumer(
                &topology,
                PAYMENT_QUEUE,
                PaymentService::new(self.adapter.clone(), self.gateway.clone()),
                &consumer_token,
            )?,
        ];
        tracing::info!(consumers = consumers.len(), "fulfillment running");

        shutdown.cancelled().await;
        tracing::info!("shutting down");

        relay_token.cancel();
        if let Err(e) = relay_task.await {
            tracing::error!(error = %e, "relay task panicked");
        }

        consumer_token.cancel();
        for (queue, task) in consumers {
            match task.await {
                Ok(Ok(summary)) => tracing::info!(
                    %queue,
                    processed = summary.processed,
                    duplicates = summary.duplicates,
                    retried = summary.retried,
                    dead_lettered = summary.dead_lettered,
                    "consumer stopped"
                ),
                Ok(Err(e)) => tracing::error!(%queue, error = %e, "consumer failed"),
                Err(e) => tracing::error!(%queue, error = %e, "consumer task panicked"),
            }
        }

        self.broker.close().await?;
        if let OutboxAdapter::Relational(store) = &self.adapter {
            store.pool().close().await;
        }
        tracing::info!("fulfillment stopped");
        Ok(())
    }

    fn spawn_consumer<H>(
        &self,
        topology: &Topology,
        queue: &str,
        handler: H,
        shutdown: &CancellationToken,
    ) -> Result<ConsumerTask>
    where
        H: EventHandler + 'static,
    {
        let spec = topology
            .find_queue(queue)
            .cloned()
            .ok_or_else(|| ServiceError::Config(format!("queue {queue} is not declared")))?;
        let consumer = IdempotentConsumer::new(
            self.broker.clone(),
            self.adapter.clone(),
            self.consumer.clone(),
        );
        let token = shutdown.clone();
        let task = tokio::spawn(async move { consumer.consume(&spec, &handler, token).await });
        Ok((queue.to_string(), task))
    }
}

/// Registers help text for the metrics the fulfillment crates emit.
pub fn describe_metrics() {
    metrics::describe_counter!("outbox_writes_total", "Outbox events committed");
    metrics::describe_counter!(
        "outbox_writes_skipped_total",
        "Writes skipped because the event already existed"
    );
    metrics::describe_counter!("relay_cycles_total", "Relay poll cycles run");
    metrics::describe_counter!("relay_events_published_total", "Records published to every sink");
    metrics::describe_counter!("relay_events_retried_total", "Records left pending after a failed publish");
    metrics::describe_counter!("relay_events_failed_total", "Records marked FAILED");
    metrics::describe_counter!("relay_events_unrouted_total", "Records with no routing rule");
    metrics::describe_gauge!("relay_batch_size", "Current adaptive batch size");
    metrics::describe_gauge!("relay_poll_interval_ms", "Current adaptive poll interval");
    metrics::describe_histogram!("relay_cycle_duration_seconds", "Duration of one relay cycle");
    metrics::describe_counter!("consumer_messages_total", "Deliveries settled, by outcome");
    metrics::describe_histogram!("consumer_handler_duration_seconds", "Handler execution time");
    metrics::describe_counter!("broker_dead_lettered_total", "Messages moved to a dead-letter queue");
    metrics::describe_counter!("saga_transitions_total", "Saga triggers applied, by outcome");
    metrics::describe_counter!("saga_conflict_retries_total", "Write conflicts retried by the saga");
    metrics::describe_counter!("orders_placed_total", "Orders placed");
    metrics::describe_counter!("inventory_reservations_total", "Reservations, by outcome");
    metrics::describe_counter!("payments_total", "Payments recorded, by status");
}
