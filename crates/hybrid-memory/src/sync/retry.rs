//! Exponential backoff for async propagation

use crate::config::RetryConfig;
use crate::error::{MemoryError, MemoryResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff schedule derived from [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// Build from configuration; the multiplier is at least 1.0
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (0-based):
    /// `initial * multiplier^retry`, capped at `max`, plus up to 25% jitter
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.initial.as_nanos() as f64 * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max.as_nanos() as f64);
        let jittered = if self.jitter {
            capped * (1.0 + fastrand::f64() * 0.25)
        } else {
            capped
        };
        Duration::from_nanos(jittered.round() as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of retries, or `cancel` fires. Returns the attempt count with the result.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> (u32, MemoryResult<T>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return (attempt, Ok(value)),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt > self.max_retries {
                return (attempt, Err(err));
            }

            let delay = self.delay(attempt - 1);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying propagation");
            tokio::select! {
                _ = cancel.cancelled() => return (attempt, Err(MemoryError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
