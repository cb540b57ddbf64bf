//! Debounce and periodic-save timers.
//!
//! One background task per connected session owns all timer state, so a
//! debounced write and the periodic tick can never race each other: whichever
//! fires first flushes and clears the dirty flag, the other finds nothing to
//! do. Flushes run inline on the task, so a tick cannot overlap a write the
//! scheduler started.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::AutosaveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    Debounced,
    Periodic,
    Manual,
}

impl SaveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveReason::Debounced => "debounced",
            SaveReason::Periodic => "periodic",
            SaveReason::Manual => "manual",
        }
    }
}

/// What became of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The data reached disk, or there was nothing to write.
    Flushed,
    /// The data was handed off without reaching disk: parked until access
    /// returns, or dropped with its session. Timers must not retry it.
    Deferred,
    /// The write failed; the data stays dirty for the next tick.
    Failed,
}

/// Receiver of scheduled writes.
#[async_trait]
pub trait WriteSink: Send + Sync {
    /// Write the current data.
    async fn flush(&self, reason: SaveReason) -> FlushOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// When false only `save_now` writes; timers stay disarmed.
    pub enabled: bool,
    pub debounce: Duration,
    pub interval: Duration,
}

impl From<&AutosaveConfig> for SchedulerConfig {
    fn from(config: &AutosaveConfig) -> Self {
        Self {
            enabled: config.enabled,
            debounce: Duration::from_millis(config.debounce_delay_ms),
            interval: Duration::from_millis(config.save_interval_ms),
        }
    }
}

enum Command {
    Notify,
    SaveNow(oneshot::Sender<bool>),
    Reconfigure(SchedulerConfig),
}

/// Handle to a running scheduler task.
#[derive(Debug)]
pub struct WriteScheduler {
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WriteScheduler {
    /// Start the scheduler. It stops when `cancel` fires, when
    /// [`WriteScheduler::stop`] is called, or when `sink` is dropped.
    pub fn spawn(sink: Weak<dyn WriteSink>, config: SchedulerConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(sink, config, rx, cancel.clone()));
        Self { tx, cancel, task }
    }

    /// Mark data dirty and (re)arm the debounce timer.
    pub fn notify(&self) {
        let _ = self.tx.send(Command::Notify);
    }

    /// Write immediately, bypassing the debounce. `true` only for
    /// [`FlushOutcome::Flushed`].
    pub async fn save_now(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::SaveNow(reply)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn reconfigure(&self, config: SchedulerConfig) {
        let _ = self.tx.send(Command::Reconfigure(config));
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel all timers. Pending notifications are dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn periodic(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    sink: Weak<dyn WriteSink>,
    mut config: SchedulerConfig,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let mut dirty = false;
    let mut deadline: Option<Instant> = None;
    let mut ticker = periodic(config.interval);

    tracing::debug!(
        enabled = config.enabled,
        debounce_ms = config.debounce.as_millis() as u64,
        interval_ms = config.interval.as_millis() as u64,
        "Write scheduler started"
    );

    loop {
        let reason = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            command = rx.recv() => match command {
                None => break,
                Some(Command::Notify) => {
                    dirty = true;
                    if config.enabled {
                        deadline = Some(Instant::now() + config.debounce);
                    }
                    continue;
                }
                Some(Command::SaveNow(reply)) => {
                    deadline = None;
                    let Some(outcome) = flush(&sink, SaveReason::Manual).await else {
                        let _ = reply.send(false);
                        break;
                    };
                    if outcome != FlushOutcome::Failed {
                        dirty = false;
                    }
                    let _ = reply.send(outcome == FlushOutcome::Flushed);
                    continue;
                }
                Some(Command::Reconfigure(next)) => {
                    if next.interval != config.interval {
                        ticker = periodic(next.interval);
                    }
                    config = next;
                    deadline = match (config.enabled, dirty) {
                        (false, _) => None,
                        (true, true) => Some(Instant::now() + config.debounce),
                        (true, false) => None,
                    };
                    continue;
                }
            },

            _ = sleep_until(deadline), if deadline.is_some() => SaveReason::Debounced,

            _ = ticker.tick(), if config.enabled => SaveReason::Periodic,
        };

        deadline = None;
        if !dirty {
            continue;
        }
        dirty = false;
        match flush(&sink, reason).await {
            Some(FlushOutcome::Flushed | FlushOutcome::Deferred) => {}
            // Keep the data dirty so the next tick tries again.
            Some(FlushOutcome::Failed) => dirty = true,
            None => break,
        }
    }

    tracing::debug!("Write scheduler stopped");
}

/// `None` once the sink has been dropped.
async fn flush(sink: &Weak<dyn WriteSink>, reason: SaveReason) -> Option<FlushOutcome> {
    let sink = sink.upgrade()?;
    tracing::debug!(reason = reason.as_str(), "Scheduled flush");
    Some(sink.flush(reason).await)
}
