//! Local-first autosave engine.
//!
//! Persists an application's data set to one JSON document inside a
//! user-selected folder: debounced and periodic writes, bounded retries,
//! permission re-validation, and optional password-based encryption at rest.
//!
//! ```rust,ignore
//! let engine = AutosaveEngine::builder()
//!     .config(ConfigLoader::load_default()?)
//!     .folder_picker(Arc::new(StaticFolderPicker::new("/data/cases")))
//!     .handle_store(HandleStore::new()?)
//!     .build()?;
//!
//! engine.connect().await?;
//! engine.set_data_provider(move || Some(app.snapshot()));
//! engine.notify_change();
//! ```

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod crypto;
pub mod data;
pub mod engine;
pub mod error;
pub mod permission;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod telemetry;

pub use config::{AutosaveConfig, AutosaveConfigUpdate, ConfigError, ConfigLoader};
pub use crypto::{CryptoError, EncryptedPayload, EncryptionHooks, PasswordEncryption};
pub use data::{FileDocument, NormalizedFileData};
pub use engine::{AutosaveEngine, AutosaveEngineBuilder};
pub use error::{AutosaveError, ErrorKind, Result};
pub use permission::{
    FileHandleReference, FolderPicker, FsPermissionBroker, HandleStore, PermissionBroker,
    StaticFolderPicker,
};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{FlushOutcome, SaveReason};
pub use status::{AutosaveState, ErrorReport, PermissionState, StatusSnapshot, Subscription};
pub use storage::{FsStorage, Storage};
pub use telemetry::MetricsSnapshot;
