//! NATS JetStream backends.
//!
//! Exchanges map onto subject prefixes of one JetStream stream
//! (`<exchange>.<routing key>`), so a queue may bind across exchanges. Each
//! queue is a durable pull consumer filtered on its bindings. Dead-lettered
//! messages are terminated on the main stream and republished on
//! `dlq.<queue>` into a separate stream whose `max_age` is the DLQ TTL.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, PullConsumer, pull},
    stream::{Config as StreamConfig, DiscardPolicy, StorageType},
};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::{Mutex, watch};

use crate::{
    AppendOnlyStream, Broker, BrokerError, DEATH_REASON_HEADER, Delivery, Headers, Nack,
    RETRY_COUNT_HEADER, Result, Topology,
};

const DLQ_SUBJECT_PREFIX: &str = "dlq";
const ORIGINAL_SUBJECT_HEADER: &str = "x-original-subject";

#[derive(Default)]
struct Outstanding {
    next_tag: u64,
    messages: BTreeMap<u64, jetstream::Message>,
}

/// [`Broker`] on NATS JetStream.
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    context: jetstream::Context,
    stream_name: String,
    outstanding: Arc<Mutex<HashMap<String, Outstanding>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl NatsBroker {
    /// Create a broker from an already-connected client. All exchanges are
    /// stored in the JetStream stream `stream_name`.
    pub fn new(client: Client, stream_name: impl Into<String>) -> Self {
        let context = jetstream::new(client.clone());
        let (closed, _) = watch::channel(false);
        Self {
            client,
            context,
            stream_name: stream_name.into(),
            outstanding: Arc::default(),
            closed: Arc::new(closed),
        }
    }

    /// Connect to a NATS server.
    pub async fn connect(url: &str, stream_name: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(Self::new(client, stream_name))
    }

    /// Get a reference to the underlying NATS client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn dlq_stream_name(&self) -> String {
        format!("{}_DLQ", self.stream_name)
    }

    async fn consumer(&self, queue: &str) -> Result<PullConsumer> {
        let stream = self
            .context
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        stream
            .get_consumer::<pull::Config>(&consumer_name(queue))
            .await
            .map_err(|_| BrokerError::UnknownQueue(queue.to_string()))
    }

    async fn take(&self, queue: &str, tag: u64) -> Result<jetstream::Message> {
        self.outstanding
            .lock()
            .await
            .get_mut(queue)
            .and_then(|o| o.messages.remove(&tag))
            .ok_or_else(|| BrokerError::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag,
            })
    }

    async fn publish_raw(&self, subject: String, payload: Vec<u8>, headers: &Headers) -> Result<()> {
        self.context
            .publish_with_headers(subject, to_header_map(headers), payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;

        let stream = self
            .context
            .get_or_create_stream(StreamConfig {
                name: self.stream_name.clone(),
                subjects: topology
                    .exchanges
                    .iter()
                    .map(|exchange| format!("{exchange}.>"))
                    .collect(),
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let dlq_ttl = topology
            .queues
            .iter()
            .map(|q| q.dlq_ttl)
            .max()
            .unwrap_or(Duration::ZERO);
        self.context
            .get_or_create_stream(StreamConfig {
                name: self.dlq_stream_name(),
                subjects: vec![format!("{DLQ_SUBJECT_PREFIX}.>")],
                max_age: dlq_ttl,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        for queue in &topology.queues {
            let filter_subjects = queue
                .bindings
                .iter()
                .map(|b| binding_subject(&b.exchange, &b.pattern))
                .collect::<Result<Vec<_>>>()?;
            let name = consumer_name(&queue.name);

            stream
                .get_or_create_consumer(
                    &name,
                    pull::Config {
                        durable_name: Some(name.clone()),
                        filter_subjects,
                        ack_policy: AckPolicy::Explicit,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        }

        tracing::info!(
            stream = %self.stream_name,
            queues = topology.queues.len(),
            "declared JetStream topology"
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
        self.publish_raw(format!("{exchange}.{routing_key}"), payload, &headers)
            .await
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<BoxStream<'static, Delivery>> {
        let mut messages = Box::pin(
            self.consumer(queue)
                .await?
                .stream()
                .max_messages_per_batch(usize::from(prefetch.max(1)))
                .messages()
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?,
        );

        let outstanding = Arc::clone(&self.outstanding);
        let mut closed = self.closed.subscribe();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                if *closed.borrow() {
                    break;
                }
                let next = tokio::select! {
                    _ = closed.changed() => break,
                    next = messages.next() => next,
                };
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::warn!(queue = %queue, error = %e, "error receiving message");
                        continue;
                    }
                    None => break,
                };

                let delivered = message.info().map(|info| info.delivered).unwrap_or(1);
                let (exchange, routing_key) = split_subject(message.subject.as_str());
                let mut headers = from_header_map(message.headers.as_ref());
                let retry_count = u64::try_from(delivered - 1).unwrap_or(0);
                let header_count = headers
                    .get(RETRY_COUNT_HEADER)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                headers.insert(
                    RETRY_COUNT_HEADER.to_string(),
                    retry_count.max(header_count).to_string(),
                );

                let mut delivery = Delivery {
                    tag: 0,
                    queue: queue.clone(),
                    exchange,
                    routing_key,
                    payload: message.payload.to_vec(),
                    headers,
                    redelivered: delivered > 1,
                };

                {
                    let mut guard = outstanding.lock().await;
                    let entry = guard.entry(queue.clone()).or_default();
                    entry.next_tag += 1;
                    delivery.tag = entry.next_tag;
                    entry.messages.insert(delivery.tag, message);
                }

                yield delivery;
            }
        };

        Ok(stream.boxed())
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<()> {
        let message = self.take(queue, tag).await?;
        message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn ack_multiple(&self, queue: &str, tag: u64) -> Result<()> {
        let settled = {
            let mut guard = self.outstanding.lock().await;
            let outstanding = guard.entry(queue.to_string()).or_default();
            let remaining = outstanding.messages.split_off(&(tag + 1));
            std::mem::replace(&mut outstanding.messages, remaining)
        };
        if settled.is_empty() {
            return Err(BrokerError::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag,
            });
        }

        for message in settled.into_values() {
            message
                .ack()
                .await
                .map_err(|e| BrokerError::Ack(e.to_string()))?;
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: u64, disposition: Nack) -> Result<()> {
        let message = self.take(queue, tag).await?;

        match disposition {
            Nack::Requeue => message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| BrokerError::Ack(e.to_string())),
            Nack::DeadLetter { reason } => {
                let mut headers = from_header_map(message.headers.as_ref());
                headers.insert(DEATH_REASON_HEADER.to_string(), reason.clone());
                headers.insert(
                    ORIGINAL_SUBJECT_HEADER.to_string(),
                    message.subject.to_string(),
                );
                self.publish_raw(
                    format!("{DLQ_SUBJECT_PREFIX}.{}", consumer_name(queue)),
                    message.payload.to_vec(),
                    &headers,
                )
                .await?;

                metrics::counter!("broker_dead_lettered_total", "queue" => queue.to_string())
                    .increment(1);
                tracing::debug!(queue, tag, %reason, "message dead-lettered");
                message
                    .ack_with(AckKind::Term)
                    .await
                    .map_err(|e| BrokerError::Ack(e.to_string()))
            }
        }
    }

    async fn retry(&self, queue: &str, tag: u64, retry_count: u32) -> Result<()> {
        // JetStream counts redeliveries itself; the next delivery reports
        // `retry_count` through `info().delivered`.
        tracing::trace!(queue, tag, retry_count, "requeueing for retry");
        let message = self.take(queue, tag).await?;
        message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }
}

/// [`AppendOnlyStream`] on NATS JetStream. Each stream key gets its own
/// JetStream stream capped at `maxlen` messages, discarding the oldest.
#[derive(Clone)]
pub struct NatsStreams {
    context: jetstream::Context,
    created: Arc<Mutex<HashSet<String>>>,
}

impl NatsStreams {
    pub fn new(client: Client) -> Self {
        Self {
            context: jetstream::new(client),
            created: Arc::default(),
        }
    }

    async fn ensure_stream(&self, stream_key: &str, maxlen: Option<u64>) -> Result<()> {
        let mut created = self.created.lock().await;
        if created.contains(stream_key) {
            return Ok(());
        }

        self.context
            .get_or_create_stream(StreamConfig {
                name: stream_name(stream_key),
                subjects: vec![stream_subject(stream_key)],
                max_messages: maxlen.and_then(|m| i64::try_from(m).ok()).unwrap_or(-1),
                discard: DiscardPolicy::Old,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        created.insert(stream_key.to_string());
        Ok(())
    }
}

#[async_trait]
impl AppendOnlyStream for NatsStreams {
    async fn append(
        &self,
        stream_key: &str,
        payload: Vec<u8>,
        headers: Headers,
        maxlen: Option<u64>,
    ) -> Result<String> {
        self.ensure_stream(stream_key, maxlen).await?;

        let ack = self
            .context
            .publish_with_headers(stream_subject(stream_key), to_header_map(&headers), payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(ack.sequence.to_string())
    }
}

/// Translates an AMQP binding into a NATS filter subject. `#` is only
/// expressible as a trailing wildcard.
fn binding_subject(exchange: &str, pattern: &str) -> Result<String> {
    let words: Vec<&str> = pattern.split('.').collect();
    let last = words.len() - 1;
    let mut subject = vec![exchange];
    for (i, word) in words.into_iter().enumerate() {
        match word {
            "#" if i == last => subject.push(">"),
            "#" => {
                return Err(BrokerError::Topology(format!(
                    "pattern '{pattern}' uses '#' before the last word"
                )));
            }
            other => subject.push(other),
        }
    }
    Ok(subject.join("."))
}

/// Durable consumer names may not contain `.`.
fn consumer_name(queue: &str) -> String {
    queue.replace(['.', '*', '>', ' '], "_")
}

fn stream_name(stream_key: &str) -> String {
    format!("STREAM_{}", consumer_name(stream_key).to_uppercase())
}

fn stream_subject(stream_key: &str) -> String {
    format!("streams.{}", consumer_name(stream_key))
}

fn split_subject(subject: &str) -> (String, String) {
    match subject.split_once('.') {
        Some((exchange, routing_key)) => (exchange.to_string(), routing_key.to_string()),
        None => (subject.to_string(), String::new()),
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn from_header_map(headers: Option<&HeaderMap>) -> Headers {
    let mut out = Headers::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                out.insert(name.to_string(), value.to_string());
            }
        }
    }
    out
}
