//! Folder capability acquisition and re-validation.
//!
//! The [`PermissionGate`] owns the single [`FileHandleReference`] of an
//! engine. Every read and write goes through it so a revoked folder is
//! detected at the next I/O instead of surfacing as an opaque failure.
//!
//! A reference to the handle (never file contents) is persisted by
//! [`HandleStore`] so a later session can reconnect without a picker.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::validate_file_name;
use crate::error::{AutosaveError, Result};
use crate::status::PermissionState;
use crate::storage::Storage;

/// Default filename for the persisted handle reference
const HANDLE_FILE: &str = "handle.json";

/// Capability to one data file inside a user-selected folder.
///
/// Only the gate creates these. A reference from a previous connection is
/// recognized as stale by its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandleReference {
    id: Uuid,
    directory: PathBuf,
    file_name: String,
}

impl FileHandleReference {
    fn new(directory: PathBuf, file_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            directory,
            file_name,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn data_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    fn sibling(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

/// Grants and reports access to a folder.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    /// Current permission without prompting.
    async fn query(&self, directory: &Path) -> PermissionState;

    /// Ask for read/write access. May prompt the user.
    async fn request(&self, directory: &Path) -> PermissionState;
}

/// Filesystem-backed broker: a folder is granted when it exists and is
/// writable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsPermissionBroker;

#[async_trait]
impl PermissionBroker for FsPermissionBroker {
    async fn query(&self, directory: &Path) -> PermissionState {
        match tokio::fs::metadata(directory).await {
            Ok(meta) if !meta.is_dir() => PermissionState::Denied,
            Ok(meta) if meta.permissions().readonly() => PermissionState::Denied,
            Ok(_) => PermissionState::Granted,
            Err(err) if err.kind() == io::ErrorKind::NotFound => PermissionState::Prompt,
            Err(_) => PermissionState::Denied,
        }
    }

    async fn request(&self, directory: &Path) -> PermissionState {
        let probe = directory.join(format!(".casekeep-probe-{}", Uuid::new_v4().simple()));
        match tokio::fs::write(&probe, b"").await {
            Ok(()) => {
                if let Err(err) = tokio::fs::remove_file(&probe).await {
                    tracing::debug!(path = %probe.display(), error = %err, "Failed to remove probe file");
                }
                PermissionState::Granted
            }
            Err(err) => {
                tracing::debug!(directory = %directory.display(), error = %err, "Write probe failed");
                PermissionState::Denied
            }
        }
    }
}

/// Asks the user for a folder. `None` means the user cancelled.
#[async_trait]
pub trait FolderPicker: Send + Sync {
    async fn pick(&self) -> Option<PathBuf>;
}

/// Picker that always answers with the same folder (or always cancels).
#[derive(Debug, Clone, Default)]
pub struct StaticFolderPicker {
    directory: Option<PathBuf>,
}

impl StaticFolderPicker {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self { directory: None }
    }
}

#[async_trait]
impl FolderPicker for StaticFolderPicker {
    async fn pick(&self) -> Option<PathBuf> {
        self.directory.clone()
    }
}

/// Handle store errors
#[derive(Debug, Error)]
pub enum HandleStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted handle reference format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedHandle {
    pub directory: PathBuf,
    pub file_name: String,
    pub saved_at: DateTime<Utc>,
}

/// Durable storage for the last connected folder.
///
/// Storage location: `$CASEKEEP_HOME/handle.json`, defaulting to the
/// platform data directory.
#[derive(Debug, Clone)]
pub struct HandleStore {
    file_path: PathBuf,
}

impl HandleStore {
    /// Create storage at the default location
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_path(default_casekeep_home()?.join(HANDLE_FILE)))
    }

    /// Create storage with custom file path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub async fn save(&self, handle: &FileHandleReference) -> std::result::Result<(), HandleStoreError> {
        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let record = PersistedHandle {
            directory: handle.directory.clone(),
            file_name: handle.file_name.clone(),
            saved_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&self.file_path, content).await?;

        // Set file permissions to user-only (Unix)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.file_path, permissions).await?;
        }

        Ok(())
    }

    pub async fn load(&self) -> std::result::Result<Option<PersistedHandle>, HandleStoreError> {
        match tokio::fs::read_to_string(&self.file_path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the persisted reference. Missing file is not an error.
    pub async fn forget(&self) -> std::result::Result<(), HandleStoreError> {
        match tokio::fs::remove_file(&self.file_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// `$CASEKEEP_HOME`, or `<data dir>/casekeep`.
pub fn default_casekeep_home() -> io::Result<PathBuf> {
    if let Some(home) = std::env::var_os("CASEKEEP_HOME").filter(|home| !home.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::data_dir()
        .map(|dir| dir.join("casekeep"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Could not determine data directory"))
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    handle: Uuid,
    modified: Option<SystemTime>,
}

/// Owner of the folder capability and the I/O performed through it.
pub struct PermissionGate {
    broker: Arc<dyn PermissionBroker>,
    picker: Arc<dyn FolderPicker>,
    store: Option<HandleStore>,
    storage: Arc<dyn Storage>,
    handle: Mutex<Option<FileHandleReference>>,
    permission: Mutex<PermissionState>,
    baseline: Mutex<Option<Baseline>>,
}

impl PermissionGate {
    pub fn new(
        broker: Arc<dyn PermissionBroker>,
        picker: Arc<dyn FolderPicker>,
        store: Option<HandleStore>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            broker,
            picker,
            store,
            storage,
            handle: Mutex::new(None),
            permission: Mutex::new(PermissionState::Prompt),
            baseline: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Option<FileHandleReference> {
        lock(&self.handle).clone()
    }

    pub fn permission(&self) -> PermissionState {
        *lock(&self.permission)
    }

    fn set_permission(&self, state: PermissionState) {
        *lock(&self.permission) = state;
    }

    /// Acquire a handle.
    ///
    /// With `pick_new` the picker chooses a folder; otherwise the persisted
    /// reference is reused, re-requesting permission if it is `prompt`.
    pub async fn connect(&self, pick_new: bool, file_name: &str) -> Result<FileHandleReference> {
        let (directory, file_name) = if pick_new {
            let directory = self.picker.pick().await.ok_or(AutosaveError::UserCancelled)?;
            (directory, file_name.to_string())
        } else {
            let persisted = self.load_persisted().await?.ok_or(AutosaveError::MissingHandle)?;
            (persisted.directory, persisted.file_name)
        };
        validate_file_name(&file_name).map_err(AutosaveError::InvalidFileName)?;

        let state = match self.broker.query(&directory).await {
            PermissionState::Granted => PermissionState::Granted,
            PermissionState::Prompt => self.broker.request(&directory).await,
            PermissionState::Denied if pick_new => self.broker.request(&directory).await,
            PermissionState::Denied => PermissionState::Denied,
        };
        self.set_permission(state);
        if state != PermissionState::Granted {
            return Err(AutosaveError::PermissionDenied { path: directory });
        }

        let handle = FileHandleReference::new(directory, file_name);
        if pick_new {
            self.persist(&handle).await;
        }
        *lock(&self.handle) = Some(handle.clone());
        lock(&self.baseline).take();
        tracing::info!(directory = %handle.directory.display(), file = %handle.file_name, "Folder connected");
        Ok(handle)
    }

    async fn persist(&self, handle: &FileHandleReference) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(handle).await {
            tracing::warn!(path = %store.path().display(), error = %err, "Failed to persist folder handle");
        }
    }

    pub async fn load_persisted(&self) -> Result<Option<PersistedHandle>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.load().await {
            Ok(persisted) => Ok(persisted),
            Err(HandleStoreError::Json(err)) => {
                tracing::warn!(path = %store.path().display(), error = %err, "Ignoring unreadable folder handle");
                Ok(None)
            }
            Err(HandleStoreError::Io(err)) => Err(AutosaveError::from_read_io(store.path(), err)),
        }
    }

    /// Remove the persisted reference so the next session starts fresh.
    pub async fn forget(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match store.forget().await {
            Ok(()) => Ok(()),
            Err(HandleStoreError::Io(err)) => Err(AutosaveError::from_write_io(store.path(), err)),
            Err(HandleStoreError::Json(err)) => Err(AutosaveError::Unknown(err.to_string())),
        }
    }

    /// Re-validate the held handle, requesting access again if the
    /// platform says the user may be asked.
    pub async fn ensure_permission(&self) -> Result<bool> {
        let handle = self.handle().ok_or(AutosaveError::MissingHandle)?;
        let state = match self.broker.query(handle.directory()).await {
            PermissionState::Prompt => self.broker.request(handle.directory()).await,
            other => other,
        };
        self.set_permission(state);
        Ok(state == PermissionState::Granted)
    }

    /// Drop the held handle. The persisted reference is kept.
    pub fn release(&self) {
        lock(&self.handle).take();
        lock(&self.baseline).take();
        self.set_permission(PermissionState::Prompt);
    }

    /// `Superseded` unless `handle` is still the one this gate holds.
    fn ensure_current(&self, handle: &FileHandleReference) -> Result<()> {
        let current = lock(&self.handle).as_ref().map(|held| held.id);
        if current == Some(handle.id) {
            Ok(())
        } else {
            Err(AutosaveError::Superseded)
        }
    }

    async fn check_access(&self, handle: &FileHandleReference) -> Result<()> {
        self.ensure_current(handle)?;
        let state = self.broker.query(handle.directory()).await;
        // The handle may have been released while the broker was answering.
        self.ensure_current(handle)?;
        self.set_permission(state);
        if state == PermissionState::Granted {
            Ok(())
        } else {
            Err(AutosaveError::PermissionDenied {
                path: handle.directory.clone(),
            })
        }
    }

    /// Read the connected data file. `None` when it does not exist yet.
    pub async fn read_data(&self, handle: &FileHandleReference) -> Result<Option<Vec<u8>>> {
        self.check_access(handle).await?;
        let path = handle.data_path();
        let bytes = self
            .storage
            .read(&path)
            .await
            .map_err(|err| AutosaveError::from_read_io(&path, err))?;
        self.record_baseline(handle, &path).await;
        Ok(bytes)
    }

    /// Replace the connected data file.
    ///
    /// If the file changed on disk since this gate last touched it, the
    /// baseline is refreshed and a retryable `ConcurrentModification` is
    /// returned; the next attempt overwrites.
    pub async fn write_data(&self, handle: &FileHandleReference, bytes: &[u8]) -> Result<()> {
        self.check_access(handle).await?;
        let path = handle.data_path();

        let expected = *lock(&self.baseline);
        if let Some(expected) = expected.filter(|b| b.handle == handle.id) {
            let actual = self
                .storage
                .modified(&path)
                .await
                .map_err(|err| AutosaveError::from_write_io(&path, err))?;
            if actual != expected.modified {
                tracing::warn!(file = %path.display(), "Data file changed on disk since last access");
                *lock(&self.baseline) = Some(Baseline {
                    handle: handle.id,
                    modified: actual,
                });
                return Err(AutosaveError::ConcurrentModification { path });
            }
        }

        // Last checkpoint before touching the disk.
        self.ensure_current(handle)?;
        self.storage
            .write(&path, bytes)
            .await
            .map_err(|err| AutosaveError::from_write_io(&path, err))?;
        self.record_baseline(handle, &path).await;
        Ok(())
    }

    async fn record_baseline(&self, handle: &FileHandleReference, path: &Path) {
        let modified = match self.storage.modified(path).await {
            Ok(modified) => modified,
            Err(err) => {
                tracing::debug!(file = %path.display(), error = %err, "Could not stat data file");
                None
            }
        };
        *lock(&self.baseline) = Some(Baseline {
            handle: handle.id,
            modified,
        });
    }

    /// Sibling `*.json` files in the connected folder.
    pub async fn list_json(&self, handle: &FileHandleReference) -> Result<Vec<String>> {
        self.check_access(handle).await?;
        self.storage
            .list_json(handle.directory())
            .await
            .map_err(|err| AutosaveError::from_read_io(handle.directory(), err))
    }

    /// Read a sibling document by name without changing the connected file.
    pub async fn read_named(&self, handle: &FileHandleReference, name: &str) -> Result<Option<Vec<u8>>> {
        validate_file_name(name).map_err(AutosaveError::InvalidFileName)?;
        if name == handle.file_name {
            return self.read_data(handle).await;
        }
        self.check_access(handle).await?;
        let path = handle.sibling(name);
        self.storage
            .read(&path)
            .await
            .map_err(|err| AutosaveError::from_read_io(&path, err))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
