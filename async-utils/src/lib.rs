//! Async utilities for cancellation-aware background work.
//!
//! Provides the `OrCancelExt` trait for racing futures against a tokio
//! `CancellationToken`, and `EpochCounter` for discarding the results of
//! work that completes after its owning session has been torn down.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The token fired before the raced future finished.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

/// Stop waiting on a future once its session token is cancelled.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// A zero duration returns immediately, even if the token is already
/// cancelled; callers check the token themselves before doing work.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> Result<(), CancelErr> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::time::sleep(duration).or_cancel(token).await
}

/// A generation token captured when a unit of work starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing generation counter.
///
/// Work captures `current()` when it starts and checks `is_current()`
/// before applying its result. Advancing the counter invalidates every
/// epoch handed out before it.
#[derive(Debug, Clone, Default)]
pub struct EpochCounter {
    inner: Arc<AtomicU64>,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.inner.load(Ordering::SeqCst))
    }

    /// Invalidate all outstanding epochs and return the new one.
    pub fn advance(&self) -> Epoch {
        Epoch(self.inner.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current() == epoch
    }
}
