//! # Broker abstraction
//!
//! Sinks and sources for outbox events:
//!
//! - [`Broker`]: AMQP-style topic exchanges, durable queues with manual
//!   acknowledgement, redelivery counting and dead-letter queues
//! - [`AppendOnlyStream`]: capped append-only logs keyed by name
//!
//! ## Implementations
//!
//! - **InMemoryBroker** / **InMemoryStreams**: full semantics in process, for
//!   development and tests
//! - **NatsBroker** / **NatsStreams**: NATS JetStream
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use broker::{Broker, Headers, InMemoryBroker, Topology};
//!
//! # async fn example() -> Result<(), broker::BrokerError> {
//! let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
//! broker.declare(&Topology::fulfillment()).await?;
//! broker
//!     .publish("order", "order.created", b"{}".to_vec(), Headers::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod nats;
mod stream;
mod topology;

pub use error::{BrokerError, Result};
pub use memory::{DeadLetter, InMemoryBroker, Published};
pub use nats::{NatsBroker, NatsStreams};
pub use stream::{AppendOnlyStream, InMemoryStreams, StreamEntry};
pub use topology::{
    Binding, DEFAULT_DLQ_TTL, DEFAULT_MAX_RETRIES, QueueSpec, Topology, matches_topic,
};

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Header carrying the producer-assigned message id.
pub const MESSAGE_ID_HEADER: &str = "message-id";
/// Header carrying the number of times a message has been retried.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Header carrying why a message was dead-lettered.
pub const DEATH_REASON_HEADER: &str = "x-death-reason";

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// A message handed to a queue subscriber. It stays unacknowledged until
/// the subscriber acks, nacks or retries it by `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Per-queue delivery tag, increasing.
    pub tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// True if this message was handed out before and requeued.
    pub redelivered: bool,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Retries already spent on this message, from `x-retry-count`.
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

/// Negative acknowledgement disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nack {
    /// Put the message back on its queue.
    Requeue,
    /// Route the message to the queue's dead-letter queue.
    DeadLetter { reason: String },
}

impl Nack {
    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Nack::DeadLetter {
            reason: reason.into(),
        }
    }
}

/// A topic-exchange message broker with manual acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares exchanges, queues, bindings and dead-letter queues.
    /// Declaring the same topology twice is a no-op.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Publishes a message to an exchange. The broker confirms the message
    /// before this returns.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<()>;

    /// Subscribes to a queue. At most `prefetch` deliveries are outstanding
    /// (unacknowledged) at a time.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<BoxStream<'static, Delivery>>;

    /// Acknowledges one delivery.
    async fn ack(&self, queue: &str, tag: u64) -> Result<()>;

    /// Acknowledges every outstanding delivery up to and including `tag`.
    async fn ack_multiple(&self, queue: &str, tag: u64) -> Result<()>;

    /// Rejects a delivery.
    async fn nack(&self, queue: &str, tag: u64, disposition: Nack) -> Result<()>;

    /// Settles a delivery and puts a copy back on its queue with
    /// `x-retry-count` set to `retry_count`.
    async fn retry(&self, queue: &str, tag: u64, retry_count: u32) -> Result<()>;

    /// Stops all subscriptions and releases the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Broker")
    }
}
