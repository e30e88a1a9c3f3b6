//! In-memory broker with AMQP-style semantics.
//!
//! Topic routing, prefetch-bounded delivery, manual acknowledgement,
//! requeue, retry and dead-lettering all behave as they would on a real
//! broker, so consumers and the relay can be exercised end to end without
//! one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::{Mutex, Notify};

use crate::{
    Broker, BrokerError, DEATH_REASON_HEADER, Delivery, Headers, Nack, QueueSpec,
    RETRY_COUNT_HEADER, Result, Topology,
};

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    headers: Headers,
    redelivered: bool,
}

impl Message {
    fn into_delivery(self, queue: &str, tag: u64) -> Delivery {
        Delivery {
            tag,
            queue: queue.to_string(),
            exchange: self.exchange,
            routing_key: self.routing_key,
            payload: self.payload,
            headers: self.headers,
            redelivered: self.redelivered,
        }
    }
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    next_tag: u64,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            next_tag: 1,
            notify: Arc::new(Notify::new()),
        }
    }

    fn take_unacked(&mut self, tag: u64) -> Result<Message> {
        self.unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::UnknownDeliveryTag {
                queue: self.spec.name.clone(),
                tag,
            })
    }
}

enum Step {
    Deliver(Delivery),
    Wait(Arc<Notify>),
    Stop,
}

/// A message parked in a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub reason: String,
    pub expires_at: Instant,
}

/// A message accepted by [`Broker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[derive(Default)]
struct Inner {
    exchanges: Vec<String>,
    queues: HashMap<String, QueueState>,
    dead_letters: HashMap<String, VecDeque<DeadLetter>>,
    published: Vec<Published>,
    unavailable: bool,
    closed: bool,
}

impl Inner {
    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable || self.closed {
            return Err(BrokerError::Unavailable(
                "in-memory broker is not accepting requests".to_string(),
            ));
        }
        Ok(())
    }

    fn dead_letter(&mut self, queue: &str, mut message: Message, reason: &str) -> Result<()> {
        let spec = &self.queue_mut(queue)?.spec;
        let dlq = spec.dead_letter_queue();
        let expires_at = Instant::now() + spec.dlq_ttl;

        message
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), reason.to_string());
        self.dead_letters.entry(dlq).or_default().push_back(DeadLetter {
            queue: queue.to_string(),
            exchange: message.exchange,
            routing_key: message.routing_key,
            payload: message.payload,
            headers: message.headers,
            reason: reason.to_string(),
            expires_at,
        });
        metrics::counter!("broker_dead_lettered_total", "queue" => queue.to_string()).increment(1);
        Ok(())
    }
}

/// In-process [`Broker`] for development and tests.
///
/// Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent request fail with [`BrokerError::Unavailable`]
    /// until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Number of messages waiting for delivery on a queue.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of delivered but unsettled messages on a queue.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Live messages in a dead-letter queue. Expired entries are dropped.
    pub async fn dead_letters(&self, dlq: &str) -> Vec<DeadLetter> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.dead_letters.get_mut(dlq) {
            Some(entries) => {
                entries.retain(|entry| entry.expires_at > now);
                entries.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Every message accepted by `publish`, in order.
    pub async fn published(&self) -> Vec<Published> {
        self.inner.lock().await.published.clone()
    }

    fn notify_all(inner: &Inner) {
        for queue in inner.queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        for exchange in &topology.exchanges {
            if !inner.exchanges.contains(exchange) {
                inner.exchanges.push(exchange.clone());
            }
        }
        for spec in &topology.queues {
            match inner.queues.get_mut(&spec.name) {
                Some(existing) => existing.spec = spec.clone(),
                None => {
                    inner
                        .queues
                        .insert(spec.name.clone(), QueueState::new(spec.clone()));
                }
            }
            inner.dead_letters.entry(spec.dead_letter_queue()).or_default();
        }

        tracing::debug!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            "declared topology"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        if !inner.exchanges.iter().any(|e| e == exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            headers,
            redelivered: false,
        };

        let mut routed = 0;
        for queue in inner.queues.values_mut() {
            if queue.spec.accepts(exchange, routing_key) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
                routed += 1;
            }
        }
        if routed == 0 {
            tracing::debug!(exchange, routing_key, "message matched no queue, dropped");
        }

        inner.published.push(Published {
            exchange: message.exchange,
            routing_key: message.routing_key,
            payload: message.payload,
            headers: message.headers,
        });
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<BoxStream<'static, Delivery>> {
        {
            let inner = self.inner.lock().await;
            inner.check_available()?;
            if !inner.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
        }

        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();
        let prefetch = usize::from(prefetch.max(1));

        let stream = async_stream::stream! {
            loop {
                let step = {
                    let mut guard = inner.lock().await;
                    let closed = guard.closed;
                    match guard.queues.get_mut(&queue) {
                        _ if closed => Step::Stop,
                        None => Step::Stop,
                        Some(state) if state.unacked.len() < prefetch && !state.ready.is_empty() => {
                            match state.ready.pop_front() {
                                Some(message) => {
                                    let tag = state.next_tag;
                                    state.next_tag += 1;
                                    state.unacked.insert(tag, message.clone());
                                    Step::Deliver(message.into_delivery(&queue, tag))
                                }
                                None => Step::Wait(Arc::clone(&state.notify)),
                            }
                        }
                        Some(state) => Step::Wait(Arc::clone(&state.notify)),
                    }
                };

                match step {
                    Step::Deliver(delivery) => yield delivery,
                    Step::Wait(notify) => {
                        let notified = notify.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();
                        // Re-check so a wakeup between the first check and
                        // `enable` is not lost.
                        let ready = {
                            let guard = inner.lock().await;
                            guard.closed
                                || guard.queues.get(&queue).is_none_or(|s| {
                                    s.unacked.len() < prefetch && !s.ready.is_empty()
                                })
                        };
                        if !ready {
                            notified.await;
                        }
                    }
                    Step::Stop => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let state = inner.queue_mut(queue)?;
        state.take_unacked(tag)?;
        state.notify.notify_waiters();
        Ok(())
    }

    async fn ack_multiple(&self, queue: &str, tag: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let state = inner.queue_mut(queue)?;
        let remaining = state.unacked.split_off(&(tag + 1));
        let acked = std::mem::replace(&mut state.unacked, remaining);
        if acked.is_empty() {
            return Err(BrokerError::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag,
            });
        }
        state.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: u64, disposition: Nack) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let state = inner.queue_mut(queue)?;
        let mut message = state.take_unacked(tag)?;

        match disposition {
            Nack::Requeue => {
                message.redelivered = true;
                state.ready.push_front(message);
                state.notify.notify_waiters();
            }
            Nack::DeadLetter { reason } => {
                state.notify.notify_waiters();
                inner.dead_letter(queue, message, &reason)?;
                tracing::debug!(queue, tag, %reason, "message dead-lettered");
            }
        }
        Ok(())
    }

    async fn retry(&self, queue: &str, tag: u64, retry_count: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let state = inner.queue_mut(queue)?;
        let mut message = state.take_unacked(tag)?;

        message
            .headers
            .insert(RETRY_COUNT_HEADER.to_string(), retry_count.to_string());
        message.redelivered = true;
        state.ready.push_back(message);
        state.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        Self::notify_all(&inner);
        Ok(())
    }
}
