//! Backoff policy for file operations.
//!
//! Wraps a single read/write attempt with a bounded number of attempts,
//! exponential backoff with jitter, and a per-failure status callback so
//! the caller can surface `retrying` while the loop is still running.

use std::future::Future;
use std::time::Duration;

use casekeep_async_utils::sleep_or_cancel;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::RetryError;
use super::classifier::RetryClassifiable;
use crate::config::AutosaveConfig;

/// Retry status for progress callbacks.
///
/// Reports one failed attempt; `next_delay` is `None` when the loop is
/// about to give up.
#[derive(Debug, Clone)]
pub struct RetryStatus {
    /// Attempt that just failed (1-indexed)
    pub attempt: u32,
    /// Total attempts the policy allows
    pub max_attempts: u32,
    /// Backoff before the next attempt
    pub next_delay: Option<Duration>,
    /// Whether the failure was classified as retryable
    pub retryable: bool,
    /// Human-readable reason
    pub reason: String,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AutosaveConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Self::default()
        }
    }

    /// Backoff after the given failed attempt, before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, fails fatally, or the attempt
    /// budget is spent.
    ///
    /// `operation` receives the 1-indexed attempt number. `on_failure` is
    /// invoked synchronously after every failed attempt, before any backoff
    /// sleep. Cancelling `cancel` aborts the loop at the next backoff.
    pub async fn attempt<F, Fut, T, E, StatusCb>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
        mut on_failure: StatusCb,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + RetryClassifiable + 'static,
        StatusCb: FnMut(&RetryStatus, &E),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Aborted);
            }

            attempt = attempt.saturating_add(1);
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = err.is_retryable();
            let exhausted = attempt >= max_attempts;
            let next_delay = if retryable && !exhausted {
                Some(
                    err.suggested_backoff()
                        .unwrap_or_else(|| apply_jitter(self.delay_for(attempt), self.jitter_factor)),
                )
            } else {
                None
            };

            let reason = match next_delay {
                Some(delay) => format!("{err}; retrying in {delay:?}"),
                None => err.to_string(),
            };
            on_failure(
                &RetryStatus {
                    attempt,
                    max_attempts,
                    next_delay,
                    retryable,
                    reason,
                },
                &err,
            );

            if !retryable {
                return Err(RetryError::Fatal(err));
            }
            let Some(delay) = next_delay else {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            };

            tracing::debug!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            if sleep_or_cancel(delay, cancel).await.is_err() {
                return Err(RetryError::Aborted);
            }
        }
    }
}

/// Apply jitter to a duration
///
/// Adds random variation (±jitter_factor) to spread out retries.
/// Example: 100ms with 0.25 jitter → 75ms to 125ms
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    let jittered_ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
