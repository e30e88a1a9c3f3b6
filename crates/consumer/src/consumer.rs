use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{Broker, Delivery, Nack, QueueSpec};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use outbox::{EventEnvelope, ProcessedMessage, ProcessedMessageStore};
use tokio_util::sync::CancellationToken;

use crate::{
    AckBatcher, Disposition, ErrorClassifier, EventHandler, HandlerError, Result, ledger_key,
    message_id,
};

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Unacknowledged deliveries the broker may hand out at once.
    pub prefetch: u16,
    /// Acks buffered before a cumulative ack. Zero acks every message
    /// individually. Capped at `prefetch`.
    pub batch_ack: usize,
    /// How long processed-message records are kept.
    pub ledger_ttl: chrono::Duration,
    /// Buffered acks are flushed when no delivery arrives within this long.
    pub idle_flush: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 10,
            batch_ack: 0,
            ledger_ttl: chrono::Duration::days(7),
            idle_flush: Duration::from_millis(100),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handled and recorded in the ledger.
    Processed,
    /// Already in the ledger; acked without invoking the handler.
    Duplicate,
    /// Requeued with its retry counter incremented.
    Retried { retry_count: u32 },
    DeadLettered { reason: String },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::Duplicate => "duplicate",
            Outcome::Retried { .. } => "retried",
            Outcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Counts per outcome over one `consume` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub processed: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl ConsumeSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Duplicate => self.duplicates += 1,
            Outcome::Retried { .. } => self.retried += 1,
            Outcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

enum Next {
    Delivery(Delivery),
    Idle,
    Closed,
}

/// Delivers each message to a handler at most once in effect.
///
/// Redelivery of a message whose id is already in the ledger is acked
/// without calling the handler. A failed handler call is retried while the
/// queue's retry budget lasts and dead-lettered after that, or at once when
/// the failure is not retriable.
#[derive(Clone)]
pub struct IdempotentConsumer<L> {
    broker: Arc<dyn Broker>,
    ledger: L,
    classifier: ErrorClassifier,
    settings: ConsumerSettings,
}

impl<L: ProcessedMessageStore> IdempotentConsumer<L> {
    pub fn new(broker: Arc<dyn Broker>, ledger: L, settings: ConsumerSettings) -> Self {
        Self {
            broker,
            ledger,
            classifier: ErrorClassifier::default(),
            settings,
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Consumes `queue` until `shutdown` fires or the broker ends the
    /// subscription. Buffered acks are flushed before returning.
    #[tracing::instrument(skip_all, fields(queue = %queue.name))]
    pub async fn consume<H>(
        &self,
        queue: &QueueSpec,
        handler: &H,
        shutdown: CancellationToken,
    ) -> Result<ConsumeSummary>
    where
        H: EventHandler + ?Sized,
    {
        let mut deliveries = self
            .broker
            .subscribe(&queue.name, self.settings.prefetch)
            .await?;
        let threshold = self
            .settings
            .batch_ack
            .min(usize::from(self.settings.prefetch.max(1)));
        let mut batcher = AckBatcher::new(threshold);
        let mut summary = ConsumeSummary::default();

        tracing::info!(
            prefetch = self.settings.prefetch,
            batch_ack = threshold,
            max_retries = queue.max_retries,
            "consumer started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = next_delivery(&mut deliveries, batcher.buffered() > 0, self.settings.idle_flush) => next,
            };

            let delivery = match next {
                Next::Delivery(delivery) => delivery,
                Next::Idle => {
                    self.flush(&queue.name, &mut batcher).await;
                    continue;
                }
                Next::Closed => {
                    tracing::info!("subscription ended");
                    break;
                }
            };

            let outcome = match self.process(queue, &delivery, handler).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(tag = delivery.tag, error = %e, "consumer infrastructure error");
                    self.failure_outcome(queue, &delivery, &HandlerError::transient(e.to_string()))
                }
            };

            metrics::counter!(
                "consumer_messages_total",
                "queue" => queue.name.clone(),
                "outcome" => outcome.as_str()
            )
            .increment(1);

            if let Err(e) = self.settle(&queue.name, &delivery, &outcome, &mut batcher).await {
                // Left unsettled; the broker redelivers it and the ledger
                // absorbs the repeat.
                tracing::warn!(tag = delivery.tag, error = %e, "failed to settle delivery");
            }
            summary.record(&outcome);
        }

        self.flush(&queue.name, &mut batcher).await;
        tracing::info!(
            processed = summary.processed,
            duplicates = summary.duplicates,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            "consumer stopped"
        );
        Ok(summary)
    }

    /// Runs one delivery through the ledger and the handler and decides how
    /// it should be settled. Does not settle it.
    #[tracing::instrument(skip_all, fields(tag = delivery.tag, routing_key = %delivery.routing_key))]
    pub async fn process<H>(
        &self,
        queue: &QueueSpec,
        delivery: &Delivery,
        handler: &H,
    ) -> Result<Outcome>
    where
        H: EventHandler + ?Sized,
    {
        let envelope = match EventEnvelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable payload");
                return Ok(Outcome::DeadLettered {
                    reason: format!("validation error: undecodable payload: {e}"),
                });
            }
        };

        let key = ledger_key(&queue.name, &message_id(delivery, &envelope));
        if self.ledger.is_processed(&key).await? {
            tracing::debug!(message_id = %key, "duplicate delivery, skipping handler");
            return Ok(Outcome::Duplicate);
        }

        let started = Instant::now();
        let result = handler.handle(&envelope).await;
        metrics::histogram!("consumer_handler_duration_seconds", "queue" => queue.name.clone())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                let record = ProcessedMessage::new(
                    key.clone(),
                    envelope.event_type.clone(),
                    envelope.aggregate_id.clone(),
                    self.settings.ledger_ttl,
                );
                if !self.ledger.record_processed(record).await? {
                    tracing::debug!(message_id = %key, "message recorded concurrently");
                }
                Ok(Outcome::Processed)
            }
            Err(error) => Ok(self.failure_outcome(queue, delivery, &error)),
        }
    }

    fn failure_outcome(&self, queue: &QueueSpec, delivery: &Delivery, error: &HandlerError) -> Outcome {
        match self.classifier.classify(error) {
            Disposition::DeadLetter => {
                tracing::warn!(tag = delivery.tag, %error, "non-retriable failure, dead-lettering");
                Outcome::DeadLettered {
                    reason: error.to_string(),
                }
            }
            Disposition::Retry => {
                let retry_count = delivery.retry_count() + 1;
                if retry_count > queue.max_retries {
                    tracing::warn!(
                        tag = delivery.tag,
                        attempts = retry_count,
                        %error,
                        "retries exhausted, dead-lettering"
                    );
                    Outcome::DeadLettered {
                        reason: format!("retries exhausted after {retry_count} attempts: {error}"),
                    }
                } else {
                    tracing::debug!(tag = delivery.tag, retry_count, %error, "retrying message");
                    Outcome::Retried { retry_count }
                }
            }
        }
    }

    async fn settle(
        &self,
        queue: &str,
        delivery: &Delivery,
        outcome: &Outcome,
        batcher: &mut AckBatcher,
    ) -> Result<()> {
        match outcome {
            Outcome::Processed | Outcome::Duplicate if batcher.is_enabled() => {
                if let Some(tag) = batcher.push(delivery.tag) {
                    self.broker.ack_multiple(queue, tag).await?;
                }
            }
            Outcome::Processed | Outcome::Duplicate => {
                self.broker.ack(queue, delivery.tag).await?;
            }
            Outcome::Retried { retry_count } => {
                self.broker.retry(queue, delivery.tag, *retry_count).await?;
            }
            Outcome::DeadLettered { reason } => {
                self.broker
                    .nack(queue, delivery.tag, Nack::dead_letter(reason.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn flush(&self, queue: &str, batcher: &mut AckBatcher) {
        if let Some(tag) = batcher.take() {
            if let Err(e) = self.broker.ack_multiple(queue, tag).await {
                tracing::warn!(tag, error = %e, "failed to flush buffered acks");
            }
        }
    }
}

async fn next_delivery(
    deliveries: &mut BoxStream<'static, Delivery>,
    acks_pending: bool,
    idle_flush: Duration,
) -> Next {
    if !acks_pending {
        return deliveries.next().await.map_or(Next::Closed, Next::Delivery);
    }
    match tokio::time::timeout(idle_flush, deliveries.next()).await {
        Ok(Some(delivery)) => Next::Delivery(delivery),
        Ok(None) => Next::Closed,
        Err(_) => Next::Idle,
    }
}
