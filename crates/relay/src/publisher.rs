use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{Headers, MESSAGE_ID_HEADER};
use futures_util::future::join_all;
use outbox::{OutboxRecord, OutboxStore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    AdaptiveController, CycleAccumulator, CycleReport, Result, RoutingTable, Sinks,
};

/// Relay tuning. Batch size and poll interval are starting points the
/// adaptive controller moves away from under load.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Records published concurrently within a cycle.
    pub parallel_chunk: usize,
    /// Run cleanup every this many cycles. Zero disables cleanup.
    pub cleanup_every: u64,
    /// How long PROCESSED records are kept before cleanup purges them.
    pub retention: chrono::Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
            parallel_chunk: 50,
            cleanup_every: 60,
            retention: chrono::Duration::hours(24),
        }
    }
}

/// Drains an outbox to its routed sinks.
///
/// Each cycle runs `FETCH -> PUBLISH -> MARK`:
/// - fetch up to the current batch size of publishable records, oldest first
/// - publish them in concurrent chunks, each record to every resolved sink
/// - mark fully published records PROCESSED, bump the retry count of the
///   rest and mark those out of retries FAILED
pub struct RelayPublisher<S: OutboxStore> {
    store: S,
    sinks: Sinks,
    routing: Arc<RoutingTable>,
    settings: RelaySettings,
    controller: AdaptiveController,
    cycles: u64,
}

impl<S: OutboxStore> RelayPublisher<S> {
    pub fn new(store: S, sinks: Sinks, routing: Arc<RoutingTable>, settings: RelaySettings) -> Self {
        let controller = AdaptiveController::new(settings.batch_size, settings.poll_interval);
        Self {
            store,
            sinks,
            routing,
            settings,
            controller,
            cycles: 0,
        }
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one full cycle.
    #[tracing::instrument(skip(self), fields(batch_size = self.controller.batch_size()))]
    pub async fn sync_once(&mut self) -> Result<CycleReport> {
        let started = Instant::now();

        let records = self
            .store
            .find_pending(self.controller.batch_size())
            .await?;
        let fetched = records.len();

        let mut acc = CycleAccumulator::new(fetched);
        for chunk in records.chunks(self.settings.parallel_chunk.max(1)) {
            let outcomes = join_all(chunk.iter().map(|record| self.publish_record(record))).await;

            for (record, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(0) => acc.unrouted(record.id),
                    Ok(_) => acc.published(record.id),
                    Err(e) => {
                        tracing::warn!(
                            record_id = %record.id,
                            event_type = %record.event_type,
                            retry_count = record.retry_count,
                            error = %e,
                            "failed to publish outbox record"
                        );
                        acc.failed(record.id);
                    }
                }
            }
        }

        let exhausted = self.mark(&acc).await?;
        let mut report = acc.finish(exhausted, started.elapsed());

        self.controller.observe(fetched);
        self.cycles += 1;
        if self.settings.cleanup_every > 0 && self.cycles % self.settings.cleanup_every == 0 {
            match self.store.cleanup(self.settings.retention).await {
                Ok(cleaned) => report.cleaned = cleaned,
                Err(e) => tracing::warn!(error = %e, "outbox cleanup failed"),
            }
        }

        record_metrics(&report, &self.controller);
        if !report.is_idle() {
            tracing::debug!(
                fetched = report.fetched,
                processed = report.processed,
                retried = report.retried,
                failed = report.failed,
                "relay cycle complete"
            );
        }
        Ok(report)
    }

    /// Polls until `shutdown` fires, then runs one last cycle so records
    /// committed during shutdown are not left behind.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "relay publisher started"
        );

        while !shutdown.is_cancelled() {
            if let Err(e) = self.sync_once().await {
                tracing::error!(error = %e, "relay cycle failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.controller.interval()) => {}
            }
        }

        match self.sync_once().await {
            Ok(report) => tracing::info!(
                processed = report.processed,
                "relay publisher stopped after final sync"
            ),
            Err(e) => tracing::error!(error = %e, "final relay sync failed"),
        }
    }

    /// Publishes a record to every sink it routes to. Returns the number of
    /// sinks, zero when the record routes nowhere.
    async fn publish_record(&self, record: &OutboxRecord) -> Result<usize> {
        let sinks = self.routing.resolve(&record.event_type);
        if sinks.is_empty() {
            return Ok(0);
        }

        let payload = record.to_envelope()?.to_bytes()?;
        let headers = message_headers(record);

        let results = join_all(sinks.iter().map(|sink| {
            self.sinks
                .publish(sink, &record.event_type, payload.clone(), headers.clone())
        }))
        .await;

        for result in results {
            result?;
        }
        Ok(sinks.len())
    }

    /// Applies the cycle's outcomes. Returns how many records were marked
    /// FAILED.
    async fn mark(&self, acc: &CycleAccumulator) -> Result<usize> {
        if !acc.processed_ids().is_empty() {
            self.store.mark_processed(acc.processed_ids()).await?;
        }
        if acc.retry_ids().is_empty() {
            return Ok(0);
        }

        let states = self.store.increment_retry(acc.retry_ids()).await?;
        let exhausted: Vec<Uuid> = states
            .iter()
            .filter(|state| state.exhausted())
            .map(|state| state.id)
            .collect();

        if !exhausted.is_empty() {
            self.store.mark_failed(&exhausted).await?;
            for id in &exhausted {
                tracing::warn!(record_id = %id, "outbox record out of retries, marked FAILED");
            }
        }
        Ok(exhausted.len())
    }
}

fn message_headers(record: &OutboxRecord) -> Headers {
    let mut headers = Headers::new();
    headers.insert(MESSAGE_ID_HEADER.to_string(), record.id.to_string());
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers
}

fn record_metrics(report: &CycleReport, controller: &AdaptiveController) {
    metrics::counter!("relay_cycles_total").increment(1);
    metrics::counter!("relay_events_published_total")
        .increment((report.processed - report.unrouted) as u64);
    metrics::counter!("relay_events_unrouted_total").increment(report.unrouted as u64);
    metrics::counter!("relay_events_retried_total").increment(report.retried as u64);
    metrics::counter!("relay_events_failed_total").increment(report.failed as u64);
    metrics::gauge!("relay_batch_size").set(controller.batch_size() as f64);
    metrics::gauge!("relay_poll_interval_ms").set(controller.interval().as_millis() as f64);
    metrics::histogram!("relay_cycle_duration_seconds").record(report.duration.as_secs_f64());
}
