use std::time::Duration;

use uuid::Uuid;

/// Outcomes collected during one relay cycle and applied in its MARK phase.
///
/// Created fresh per cycle; nothing carries over between cycles.
#[derive(Debug, Default)]
pub struct CycleAccumulator {
    fetched: usize,
    processed: Vec<Uuid>,
    retry: Vec<Uuid>,
    unrouted: usize,
}

impl CycleAccumulator {
    pub fn new(fetched: usize) -> Self {
        Self {
            fetched,
            ..Default::default()
        }
    }

    /// Every resolved sink confirmed the record.
    pub fn published(&mut self, id: Uuid) {
        self.processed.push(id);
    }

    /// No sink matched; the record is still marked processed.
    pub fn unrouted(&mut self, id: Uuid) {
        self.unrouted += 1;
        self.processed.push(id);
    }

    /// At least one sink failed.
    pub fn failed(&mut self, id: Uuid) {
        self.retry.push(id);
    }

    pub fn processed_ids(&self) -> &[Uuid] {
        &self.processed
    }

    pub fn retry_ids(&self) -> &[Uuid] {
        &self.retry
    }

    /// Closes the cycle.
    pub fn finish(self, exhausted: usize, duration: Duration) -> CycleReport {
        CycleReport {
            fetched: self.fetched,
            processed: self.processed.len(),
            unrouted: self.unrouted,
            retried: self.retry.len() - exhausted.min(self.retry.len()),
            failed: exhausted,
            cleaned: 0,
            duration,
        }
    }
}

/// Summary of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    /// Records marked PROCESSED, including unrouted ones.
    pub processed: usize,
    pub unrouted: usize,
    /// Records left PENDING with their retry count incremented.
    pub retried: usize,
    /// Records that ran out of retries and were marked FAILED.
    pub failed: usize,
    /// Records purged by cleanup, when it ran this cycle.
    pub cleaned: u64,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}
