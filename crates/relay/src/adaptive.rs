use std::time::Duration;

/// What an observation did to the batch size and poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Light load: smaller batches, slower polling.
    Shrunk,
    /// The fetch filled the batch: larger batches, faster polling.
    Grown,
    Unchanged,
}

/// Adapts batch size and poll interval to how full each fetch was.
///
/// ```text
/// fetched < batch/2  -> batch /= 2 (floor base/5),  interval *= 2 (cap 5x base)
/// fetched >= batch   -> batch *= 2 (cap 5x base),   interval /= 2 (floor base/10)
/// ```
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    base_batch: usize,
    base_interval: Duration,
    batch: usize,
    interval: Duration,
}

impl AdaptiveController {
    pub fn new(base_batch: usize, base_interval: Duration) -> Self {
        let base_batch = base_batch.max(1);
        Self {
            base_batch,
            base_interval,
            batch: base_batch,
            interval: base_interval,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn min_batch(&self) -> usize {
        (self.base_batch / 5).max(1)
    }

    fn max_batch(&self) -> usize {
        self.base_batch.saturating_mul(5)
    }

    fn min_interval(&self) -> Duration {
        self.base_interval / 10
    }

    fn max_interval(&self) -> Duration {
        self.base_interval.saturating_mul(5)
    }

    /// Records how many records the last fetch returned.
    pub fn observe(&mut self, fetched: usize) -> Adjustment {
        if fetched.saturating_mul(2) < self.batch {
            let batch = (self.batch / 2).max(self.min_batch());
            let interval = self.interval.saturating_mul(2).min(self.max_interval());
            return self.apply(batch, interval, Adjustment::Shrunk);
        }
        if fetched >= self.batch {
            let batch = self.batch.saturating_mul(2).min(self.max_batch());
            let interval = (self.interval / 2).max(self.min_interval());
            return self.apply(batch, interval, Adjustment::Grown);
        }
        Adjustment::Unchanged
    }

    fn apply(&mut self, batch: usize, interval: Duration, adjustment: Adjustment) -> Adjustment {
        if batch == self.batch && interval == self.interval {
            return Adjustment::Unchanged;
        }
        self.batch = batch;
        self.interval = interval;
        adjustment
    }
}
