//! Error classification for retry decisions

use std::time::Duration;

/// Top-level error classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient errors that should be retried with backoff
    Retryable(RetryableError),

    /// Errors that need user action; never retried automatically
    Fatal(FatalError),
}

/// Transient errors (retry recommended)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryableError {
    #[error("I/O timed out or was interrupted")]
    TimedOut,

    #[error("file is busy")]
    Busy,

    #[error("file was modified by another writer")]
    ConcurrentModification,

    #[error("file handle is stale")]
    StaleHandle,

    #[error("unclassified transient failure")]
    Unknown,
}

/// Fatal errors (do NOT retry)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("connection to the data folder was lost")]
    ConnectionLost,

    #[error("no folder connected")]
    MissingHandle,

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("data file is corrupt")]
    CorruptData,

    #[error("decryption failed")]
    Decryption,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,
}

/// Trait for error classification
pub trait RetryClassifiable {
    fn classify(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable(_))
    }

    /// Fixed delay to use instead of the exponential schedule, if the error
    /// carries a better hint.
    fn suggested_backoff(&self) -> Option<Duration>;
}

/// Heuristic classification for errors that arrive as opaque text.
///
/// Only used when no structured error code is available.
pub fn classify_message(msg: &str) -> ErrorClass {
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("quota")
        || msg_lower.contains("no space")
        || msg_lower.contains("disk full")
    {
        return ErrorClass::Fatal(FatalError::QuotaExceeded);
    }

    if msg_lower.contains("permission")
        || msg_lower.contains("not allowed")
        || msg_lower.contains("access denied")
        || msg_lower.contains("read-only")
    {
        return ErrorClass::Fatal(FatalError::PermissionDenied);
    }

    if msg_lower.contains("decrypt") || msg_lower.contains("authentication tag") {
        return ErrorClass::Fatal(FatalError::Decryption);
    }

    if msg_lower.contains("modified") || msg_lower.contains("state cached") {
        return ErrorClass::Retryable(RetryableError::ConcurrentModification);
    }

    if msg_lower.contains("stale") {
        return ErrorClass::Retryable(RetryableError::StaleHandle);
    }

    if msg_lower.contains("busy") || msg_lower.contains("locked") {
        return ErrorClass::Retryable(RetryableError::Busy);
    }

    if msg_lower.contains("timeout")
        || msg_lower.contains("timed out")
        || msg_lower.contains("temporarily")
    {
        return ErrorClass::Retryable(RetryableError::TimedOut);
    }

    // Default: assume retryable (conservative)
    ErrorClass::Retryable(RetryableError::Unknown)
}
