//! Local retry of write conflicts with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use common::ErrorKind;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::SagaError;

/// Backoff settings for write-conflict retries.
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetry {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    /// Upper bound of the random delay added to every backoff.
    pub max_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            factor: 2,
            max_jitter: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl ConflictRetry {
    /// Retries that never sleep.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Backoff plus random jitter, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (self.backoff(attempt) + jitter).min(self.max_delay)
    }

    /// Runs `operation`, retrying while it fails with a conflict. Any other
    /// error, or the last conflict once attempts are used up, is returned.
    pub async fn run<F, Fut, T>(&self, context: &str, mut operation: F) -> Result<T, SagaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SagaError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(context, attempt, "succeeded after conflict retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.kind() == ErrorKind::Conflict && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        context,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "write conflict, retrying"
                    );
                    metrics::counter!("saga_conflict_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.kind() == ErrorKind::Conflict {
                        warn!(context, attempts = attempt, error = %err, "conflict retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
