//! Bounded retry with increasing backoff.
//!
//! This module provides:
//! - Error classification (retryable vs fatal)
//! - Exponential backoff with jitter, capped at a maximum delay
//! - A total attempt budget (3 attempts by default)
//! - Cancellation of backoff sleeps via tokio `CancellationToken`
//! - Per-failure callbacks for status reporting

pub mod classifier;
pub mod policy;

pub use classifier::{ErrorClass, FatalError, RetryClassifiable, RetryableError};
pub use policy::{RetryPolicy, RetryStatus};

/// Final outcome of a retried operation that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    /// A fatal error short-circuited the retry loop.
    #[error(transparent)]
    Fatal(E),

    /// The retry loop was cancelled, either during backoff or because the
    /// operation reported its context was gone.
    #[error("retry aborted by cancellation")]
    Aborted,
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The underlying error, if the loop ended on one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal(err) => Some(err),
            RetryError::Aborted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}
