//! Timing and save counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Logs the elapsed time of an operation when dropped.
///
/// ```rust,ignore
/// let _timer = OperationTimer::new("read_file");
/// // ... work ...
/// // logged here
/// ```
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the elapsed duration (logs automatically)
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        tracing::debug!(
            operation = self.operation,
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

/// Counters for the lifetime of one engine.
#[derive(Debug, Default)]
pub struct SaveMetrics {
    saves_succeeded: AtomicU64,
    saves_failed: AtomicU64,
    retries: AtomicU64,
    discarded: AtomicU64,
    bytes_written: AtomicU64,
    last_save_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub saves_succeeded: u64,
    pub saves_failed: u64,
    /// Failed attempts that were followed by another attempt.
    pub retries: u64,
    /// Writes dropped because the session ended before they applied.
    pub discarded: u64,
    pub bytes_written: u64,
    pub last_save_duration_ms: u64,
}

impl SaveMetrics {
    pub fn record_success(&self, bytes: usize, elapsed: Duration) {
        self.saves_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_save_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.saves_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            saves_succeeded: self.saves_succeeded.load(Ordering::Relaxed),
            saves_failed: self.saves_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            last_save_duration_ms: self.last_save_duration_ms.load(Ordering::Relaxed),
        }
    }
}
