//! Error taxonomy for the autosave engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::retry::{ErrorClass, FatalError, RetryClassifiable, RetryableError, classifier};

pub type Result<T> = std::result::Result<T, AutosaveError>;

/// Coarse category reported to status subscribers and error listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UserCancelled,
    PermissionDenied,
    MissingHandle,
    ConnectionLost,
    ReadFailed,
    WriteFailed,
    QuotaExceeded,
    DecryptionFailed,
    Unknown,
}

#[derive(Debug, Error)]
pub enum AutosaveError {
    #[error("folder selection was cancelled")]
    UserCancelled,

    #[error("permission denied for {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("no folder is connected")]
    MissingHandle,

    #[error("connection to {} was lost", path.display())]
    ConnectionLost { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} was modified by another writer", path.display())]
    ConcurrentModification { path: PathBuf },

    #[error("out of storage space writing {}: {source}", path.display())]
    QuotaExceeded {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not valid data: {source}", path.display())]
    CorruptData {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize data: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Decryption(#[from] CryptoError),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The session the operation started in was torn down.
    #[error("operation superseded by disconnect")]
    Superseded,

    #[error("{0}")]
    Unknown(String),
}

impl AutosaveError {
    /// Map an I/O failure from a read into the taxonomy.
    pub fn from_read_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match classify_io_error(&source) {
            Some(ErrorClass::Fatal(FatalError::PermissionDenied)) => {
                AutosaveError::PermissionDenied { path }
            }
            Some(ErrorClass::Fatal(FatalError::ConnectionLost)) => {
                AutosaveError::ConnectionLost { path }
            }
            _ => AutosaveError::ReadFailed { path, source },
        }
    }

    /// Map an I/O failure from a write into the taxonomy.
    pub fn from_write_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match classify_io_error(&source) {
            Some(ErrorClass::Fatal(FatalError::PermissionDenied)) => {
                AutosaveError::PermissionDenied { path }
            }
            Some(ErrorClass::Fatal(FatalError::QuotaExceeded)) => {
                AutosaveError::QuotaExceeded { path, source }
            }
            Some(ErrorClass::Fatal(FatalError::ConnectionLost)) => {
                AutosaveError::ConnectionLost { path }
            }
            _ => AutosaveError::WriteFailed { path, source },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AutosaveError::UserCancelled => ErrorKind::UserCancelled,
            AutosaveError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            AutosaveError::MissingHandle => ErrorKind::MissingHandle,
            AutosaveError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            AutosaveError::ReadFailed { .. } | AutosaveError::CorruptData { .. } => {
                ErrorKind::ReadFailed
            }
            AutosaveError::WriteFailed { .. }
            | AutosaveError::ConcurrentModification { .. }
            | AutosaveError::Serialize(_) => ErrorKind::WriteFailed,
            AutosaveError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            AutosaveError::Decryption(_) => ErrorKind::DecryptionFailed,
            AutosaveError::InvalidFileName(_)
            | AutosaveError::Config(_)
            | AutosaveError::Superseded
            | AutosaveError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether this error means the folder capability is gone and the
    /// engine should wait for `ensure_permission`.
    pub fn is_permission_loss(&self) -> bool {
        matches!(self, AutosaveError::PermissionDenied { .. })
    }
}

impl RetryClassifiable for AutosaveError {
    fn classify(&self) -> ErrorClass {
        match self {
            AutosaveError::UserCancelled | AutosaveError::Superseded => {
                ErrorClass::Fatal(FatalError::Cancelled)
            }
            AutosaveError::PermissionDenied { .. } => ErrorClass::Fatal(FatalError::PermissionDenied),
            AutosaveError::MissingHandle => ErrorClass::Fatal(FatalError::MissingHandle),
            AutosaveError::ConnectionLost { .. } => ErrorClass::Fatal(FatalError::ConnectionLost),
            AutosaveError::QuotaExceeded { .. } => ErrorClass::Fatal(FatalError::QuotaExceeded),
            AutosaveError::CorruptData { .. } => ErrorClass::Fatal(FatalError::CorruptData),
            AutosaveError::Decryption(_) => ErrorClass::Fatal(FatalError::Decryption),
            AutosaveError::Serialize(err) => {
                ErrorClass::Fatal(FatalError::InvalidInput(err.to_string()))
            }
            AutosaveError::InvalidFileName(name) => {
                ErrorClass::Fatal(FatalError::InvalidInput(name.clone()))
            }
            AutosaveError::Config(err) => ErrorClass::Fatal(FatalError::InvalidInput(err.to_string())),
            AutosaveError::ConcurrentModification { .. } => {
                ErrorClass::Retryable(RetryableError::ConcurrentModification)
            }
            AutosaveError::ReadFailed { source, .. } | AutosaveError::WriteFailed { source, .. } => {
                classify_io_error(source)
                    .unwrap_or_else(|| classifier::classify_message(&source.to_string()))
            }
            AutosaveError::Unknown(message) => classifier::classify_message(message),
        }
    }

    fn suggested_backoff(&self) -> Option<Duration> {
        match self.classify() {
            ErrorClass::Retryable(RetryableError::Busy) => Some(Duration::from_millis(200)),
            ErrorClass::Retryable(RetryableError::ConcurrentModification) => {
                Some(Duration::from_millis(100))
            }
            _ => None,
        }
    }
}

/// Structured classification of an I/O error.
///
/// Returns `None` when neither the kind nor the OS code is recognized, so
/// callers can fall back to message heuristics.
pub fn classify_io_error(err: &io::Error) -> Option<ErrorClass> {
    use io::ErrorKind as K;

    let by_kind = match err.kind() {
        K::PermissionDenied | K::ReadOnlyFilesystem => {
            Some(ErrorClass::Fatal(FatalError::PermissionDenied))
        }
        K::StorageFull => Some(ErrorClass::Fatal(FatalError::QuotaExceeded)),
        K::NotFound | K::NotADirectory => Some(ErrorClass::Fatal(FatalError::ConnectionLost)),
        K::InvalidData => Some(ErrorClass::Fatal(FatalError::CorruptData)),
        K::TimedOut | K::Interrupted => Some(ErrorClass::Retryable(RetryableError::TimedOut)),
        K::WouldBlock | K::ResourceBusy => Some(ErrorClass::Retryable(RetryableError::Busy)),
        _ => None,
    };
    by_kind.or_else(|| err.raw_os_error().and_then(classify_os_code))
}

#[cfg(unix)]
fn classify_os_code(code: i32) -> Option<ErrorClass> {
    match code {
        // EPERM, EACCES, EROFS
        1 | 13 | 30 => Some(ErrorClass::Fatal(FatalError::PermissionDenied)),
        // ENOSPC, EDQUOT (Linux)
        28 | 122 => Some(ErrorClass::Fatal(FatalError::QuotaExceeded)),
        // ESTALE (Linux)
        116 => Some(ErrorClass::Retryable(RetryableError::StaleHandle)),
        // EBUSY, EAGAIN
        16 | 11 => Some(ErrorClass::Retryable(RetryableError::Busy)),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os_code(_code: i32) -> Option<ErrorClass> {
    None
}
