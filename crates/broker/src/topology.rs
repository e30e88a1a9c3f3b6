use std::collections::HashSet;
use std::time::Duration;

use crate::{BrokerError, Result};

/// Default redelivery budget for a queue.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default lifetime of a dead-lettered message.
pub const DEFAULT_DLQ_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A routing-key pattern binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    /// Topic pattern; `*` matches one word, `#` zero or more.
    pub pattern: String,
}

impl Binding {
    pub fn new(exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            pattern: pattern.into(),
        }
    }

    pub fn matches(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange == exchange && matches_topic(&self.pattern, routing_key)
    }
}

/// A durable queue with its own dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<Binding>,
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_retries: u32,
    /// How long a message stays in the dead-letter queue.
    pub dlq_ttl: Duration,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            dlq_ttl: DEFAULT_DLQ_TTL,
        }
    }

    pub fn bind(mut self, exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.bindings.push(Binding::new(exchange, pattern));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn dlq_ttl(mut self, ttl: Duration) -> Self {
        self.dlq_ttl = ttl;
        self
    }

    /// Name of the dead-letter queue, `<queue>.dlq`.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.name)
    }

    pub fn accepts(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings.iter().any(|b| b.matches(exchange, routing_key))
    }
}

/// Exchanges and queues to declare on a broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Topic exchange names.
    pub exchanges: Vec<String>,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.exchanges.push(name.into());
        self
    }

    pub fn queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn find_queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// The order fulfillment topology: one topic exchange per domain and one
    /// work queue per consuming service.
    pub fn fulfillment() -> Self {
        Topology::new()
            .exchange("order")
            .exchange("inventory")
            .exchange("payment")
            .queue(
                QueueSpec::new("saga.order-events")
                    .bind("inventory", "inventory.*")
                    .bind("payment", "payment.succeeded")
                    .bind("payment", "payment.failed"),
            )
            .queue(
                QueueSpec::new("inventory.order-events")
                    .bind("order", "order.initiated")
                    .bind("order", "order.failed")
                    .bind("order", "order.compensation_requested"),
            )
            .queue(
                QueueSpec::new("payment.order-events")
                    .bind("order", "order.created")
                    .bind("order", "order.failed"),
            )
    }

    /// Checks that names are unique and every binding targets a declared
    /// exchange.
    pub fn validate(&self) -> Result<()> {
        let mut exchanges = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.is_empty() || exchange.contains(['.', '*', '#', '>']) {
                return Err(BrokerError::Topology(format!(
                    "invalid exchange name '{exchange}'"
                )));
            }
            if !exchanges.insert(exchange.as_str()) {
                return Err(BrokerError::Topology(format!(
                    "exchange '{exchange}' declared twice"
                )));
            }
        }

        let mut queues = HashSet::new();
        for queue in &self.queues {
            if !queues.insert(queue.name.as_str()) {
                return Err(BrokerError::Topology(format!(
                    "queue '{}' declared twice",
                    queue.name
                )));
            }
            for binding in &queue.bindings {
                if !exchanges.contains(binding.exchange.as_str()) {
                    return Err(BrokerError::Topology(format!(
                        "queue '{}' binds to undeclared exchange '{}'",
                        queue.name, binding.exchange
                    )));
                }
                if binding.pattern.is_empty() {
                    return Err(BrokerError::Topology(format!(
                        "queue '{}' has an empty binding pattern",
                        queue.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Matches a routing key against an AMQP topic pattern.
///
/// - `*` matches exactly one word
/// - `#` matches zero or more words
///
/// # Examples
/// - `inventory.*` matches `inventory.reserved`
/// - `order.#` matches `order` and `order.item.added`
/// - `inventory.*` does NOT match `inventory.item.reserved`
pub fn matches_topic(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
