//! The autosave orchestrator.
//!
//! [`AutosaveEngine`] ties the permission gate, encryption hooks, write
//! scheduler, retry policy and status publisher together behind a small
//! connect / save / read API.
//!
//! Concurrency model:
//! - reads and writes against the handle are serialized by one async mutex,
//!   so at most one write is in flight and later requests queue behind it;
//! - every connection is a session with its own epoch and cancellation
//!   token. `disconnect` advances the epoch and cancels the token; work that
//!   started under an older epoch is discarded at its next checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use async_trait::async_trait;
use casekeep_async_utils::{Epoch, EpochCounter};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{AutosaveConfig, AutosaveConfigUpdate};
use crate::crypto::{CryptoError, EncryptionHooks};
use crate::data::{FileDocument, NormalizedFileData};
use crate::error::{AutosaveError, Result};
use crate::permission::{
    FileHandleReference, FolderPicker, FsPermissionBroker, HandleStore, PermissionBroker,
    PermissionGate, StaticFolderPicker,
};
use crate::retry::{RetryError, RetryPolicy};
use crate::scheduler::{FlushOutcome, SaveReason, SchedulerConfig, WriteScheduler, WriteSink};
use crate::status::{
    AutosaveState, ErrorReport, PermissionState, StatusPublisher, StatusSnapshot, Subscribers,
    Subscription,
};
use crate::storage::{FsStorage, Storage};
use crate::telemetry::{MetricsSnapshot, OperationTimer, SaveMetrics};

type DataProvider = Arc<dyn Fn() -> Option<NormalizedFileData> + Send + Sync>;
type DataLoadCallback = Arc<dyn Fn(&NormalizedFileData) + Send + Sync>;

struct Session {
    epoch: Epoch,
    cancel: CancellationToken,
    scheduler: Arc<WriteScheduler>,
}

/// Result of one pass through the write path.
enum WriteOutcome {
    Written,
    /// Permission is gone; the data is parked until it comes back.
    Parked,
    /// The session ended before the write applied.
    Discarded,
    Failed,
}

struct EngineInner {
    config: Mutex<AutosaveConfig>,
    gate: PermissionGate,
    status: StatusPublisher,
    errors: Subscribers<ErrorReport>,
    metrics: SaveMetrics,
    epochs: EpochCounter,
    shutdown: CancellationToken,
    session: Mutex<Option<Session>>,
    hooks: Mutex<Option<Arc<dyn EncryptionHooks>>>,
    write_lock: tokio::sync::Mutex<()>,
    parked: Mutex<Option<NormalizedFileData>>,
    data_provider: Mutex<Option<DataProvider>>,
    on_data_loaded: Mutex<Option<DataLoadCallback>>,
    file_encrypted: AtomicBool,
}

/// Cloneable handle to one engine. Clones share state.
#[derive(Clone)]
pub struct AutosaveEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AutosaveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutosaveEngine")
            .field("status", &self.inner.status.current().status)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AutosaveEngine`]. Unset seams default to the local
/// filesystem implementations.
#[derive(Default)]
pub struct AutosaveEngineBuilder {
    config: AutosaveConfig,
    storage: Option<Arc<dyn Storage>>,
    broker: Option<Arc<dyn PermissionBroker>>,
    picker: Option<Arc<dyn FolderPicker>>,
    handle_store: Option<HandleStore>,
    hooks: Option<Arc<dyn EncryptionHooks>>,
}

impl AutosaveEngineBuilder {
    pub fn config(mut self, config: AutosaveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn permission_broker(mut self, broker: Arc<dyn PermissionBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn folder_picker(mut self, picker: Arc<dyn FolderPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    pub fn handle_store(mut self, store: HandleStore) -> Self {
        self.handle_store = Some(store);
        self
    }

    pub fn encryption_hooks(mut self, hooks: Arc<dyn EncryptionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Result<AutosaveEngine> {
        self.config.validate()?;

        let gate = PermissionGate::new(
            self.broker.unwrap_or_else(|| Arc::new(FsPermissionBroker)),
            self.picker
                .unwrap_or_else(|| Arc::new(StaticFolderPicker::cancelled())),
            self.handle_store,
            self.storage.unwrap_or_else(|| Arc::new(FsStorage)),
        );

        Ok(AutosaveEngine {
            inner: Arc::new(EngineInner {
                config: Mutex::new(self.config),
                gate,
                status: StatusPublisher::default(),
                errors: Subscribers::new(),
                metrics: SaveMetrics::default(),
                epochs: EpochCounter::new(),
                shutdown: CancellationToken::new(),
                session: Mutex::new(None),
                hooks: Mutex::new(self.hooks),
                write_lock: tokio::sync::Mutex::new(()),
                parked: Mutex::new(None),
                data_provider: Mutex::new(None),
                on_data_loaded: Mutex::new(None),
                file_encrypted: AtomicBool::new(false),
            }),
        })
    }
}

impl AutosaveEngine {
    pub fn builder() -> AutosaveEngineBuilder {
        AutosaveEngineBuilder::default()
    }

    /// Pick a folder and connect to it. `Ok(false)` if the user cancelled
    /// the picker.
    pub async fn connect(&self) -> Result<bool> {
        self.establish(true).await
    }

    /// Reconnect to the folder persisted by an earlier session.
    pub async fn connect_to_existing(&self) -> Result<bool> {
        self.establish(false).await
    }

    async fn establish(&self, pick_new: bool) -> Result<bool> {
        let inner = &self.inner;
        let parked = lock(&inner.parked).take();
        inner.teardown();

        inner.status.update(|s| {
            s.status = AutosaveState::Connecting;
            s.message = "Connecting".to_string();
            s.consecutive_failures = 0;
        });

        let file_name = inner.config().file_name;
        let handle = match inner.gate.connect(pick_new, &file_name).await {
            Ok(handle) => handle,
            Err(AutosaveError::UserCancelled) => {
                *lock(&inner.parked) = parked;
                inner.status.update(|s| {
                    s.status = AutosaveState::Disconnected;
                    s.message = "Folder selection cancelled".to_string();
                    s.permission_status = PermissionState::Prompt;
                });
                tracing::info!("Folder selection cancelled");
                return Ok(false);
            }
            Err(err) => {
                *lock(&inner.parked) = parked;
                let permission = inner.gate.permission();
                inner.status.update(|s| {
                    s.status = AutosaveState::Error;
                    s.message = err.to_string();
                    s.permission_status = permission;
                });
                inner.report(&err);
                return Err(err);
            }
        };

        let epoch = self.start_session();
        let state = inner.resting_state();
        inner.status.update(|s| {
            s.status = state;
            s.message = format!("Connected to {}", handle.directory().display());
            s.permission_status = PermissionState::Granted;
        });
        tracing::info!(%epoch, directory = %handle.directory().display(), "Session started");

        let loaded = inner.inspect_data_file().await;
        let callback = lock(&inner.on_data_loaded).clone();
        if let (Some(callback), Some(data)) = (callback, loaded) {
            callback(&data);
        }

        if let Some(data) = parked {
            tracing::info!("Replaying write queued before reconnect");
            inner.write_data(data).await;
        }
        Ok(true)
    }

    fn start_session(&self) -> Epoch {
        let inner = &self.inner;
        let epoch = inner.epochs.advance();
        let cancel = inner.shutdown.child_token();
        let sink: Weak<dyn WriteSink> = Arc::downgrade(&self.inner) as Weak<EngineInner>;
        let scheduler = WriteScheduler::spawn(
            sink,
            SchedulerConfig::from(&inner.config()),
            cancel.clone(),
        );
        *lock(&inner.session) = Some(Session {
            epoch,
            cancel,
            scheduler: Arc::new(scheduler),
        });
        epoch
    }

    /// Tear down the session. Timers are cancelled, cached key material is
    /// dropped, and any write still in flight is discarded when it lands.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.teardown();
        lock(&inner.parked).take();
        inner.status.update(|s| {
            s.status = AutosaveState::Disconnected;
            s.message = "Disconnected".to_string();
            s.permission_status = PermissionState::Prompt;
            s.consecutive_failures = 0;
        });
        tracing::info!("Disconnected");
    }

    /// Disconnect and remove the persisted folder reference.
    pub async fn forget_folder(&self) -> Result<()> {
        self.disconnect();
        self.inner.gate.forget().await
    }

    /// Write `data` now. Waits behind any write already in flight.
    pub async fn save(&self, data: NormalizedFileData) -> bool {
        matches!(self.inner.write_data(data).await, WriteOutcome::Written)
    }

    /// Write the provider's current data immediately, bypassing the
    /// debounce. `true` once the data is on disk or there is nothing to
    /// write; a write parked while waiting for permission is not saved.
    pub async fn save_now(&self) -> bool {
        let scheduler = self.inner.scheduler();
        match scheduler {
            Some(scheduler) => scheduler.save_now().await,
            None => {
                self.inner.report(&AutosaveError::MissingHandle);
                false
            }
        }
    }

    /// Tell the scheduler the application data changed.
    pub fn notify_change(&self) {
        match self.inner.scheduler() {
            Some(scheduler) => scheduler.notify(),
            None => tracing::debug!("Change notification without a session"),
        }
    }

    /// Re-validate folder access. On success the engine leaves `waiting`
    /// and replays the parked write.
    pub async fn ensure_permission(&self) -> Result<bool> {
        let inner = &self.inner;
        let granted = match inner.gate.ensure_permission().await {
            Ok(granted) => granted,
            Err(err) => {
                inner.report(&err);
                return Err(err);
            }
        };

        if !granted {
            let permission = inner.gate.permission();
            inner.status.update(|s| {
                s.status = AutosaveState::Waiting;
                s.message = "Folder access is required to keep saving".to_string();
                s.permission_status = permission;
            });
            return Ok(false);
        }

        let state = inner.resting_state();
        inner.status.update(|s| {
            s.status = state;
            s.message = "Folder access restored".to_string();
            s.permission_status = PermissionState::Granted;
        });

        let parked = lock(&inner.parked).take();
        if let Some(data) = parked {
            tracing::info!("Replaying write parked while waiting for permission");
            inner.write_data(data).await;
        }
        Ok(true)
    }

    pub fn update_config(&self, update: &AutosaveConfigUpdate) -> Result<AutosaveConfig> {
        let inner = &self.inner;
        let next = {
            let mut config = lock(&inner.config);
            config.apply(update)?;
            config.clone()
        };

        if let Some(scheduler) = inner.scheduler() {
            scheduler.reconfigure(SchedulerConfig::from(&next));
            let state = inner.resting_state();
            inner.status.update(|s| {
                if matches!(s.status, AutosaveState::Idle | AutosaveState::Connected) {
                    s.status = state;
                }
            });
        }
        tracing::info!(
            enabled = next.enabled,
            debounce_ms = next.debounce_delay_ms,
            interval_ms = next.save_interval_ms,
            max_retries = next.max_retries,
            "Autosave configuration updated"
        );
        Ok(next)
    }

    pub fn config(&self) -> AutosaveConfig {
        self.inner.config()
    }

    /// Sibling `*.json` documents in the connected folder.
    pub async fn list_data_files(&self) -> Result<Vec<String>> {
        let inner = &self.inner;
        let result = match inner.gate.handle() {
            Some(handle) => inner.gate.list_json(&handle).await,
            None => Err(AutosaveError::MissingHandle),
        };
        if let Err(err) = &result {
            inner.handle_read_error(err);
        }
        result
    }

    /// Read and decode the connected data file. `None` if it does not exist.
    pub async fn read_file(&self) -> Result<Option<NormalizedFileData>> {
        self.inner.read_current().await
    }

    /// Read a sibling document without switching the connected file.
    pub async fn read_named_file(&self, name: &str) -> Result<Option<NormalizedFileData>> {
        let inner = &self.inner;
        let gate = &inner.gate;
        let result = inner
            .read_with(move |handle| async move { gate.read_named(&handle, name).await })
            .await;
        let result = match result {
            Ok(Some(bytes)) => inner.decode(&bytes, name, false).await.map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            inner.handle_read_error(err);
        }
        result
    }

    pub fn set_data_load_callback(&self, callback: impl Fn(&NormalizedFileData) + Send + Sync + 'static) {
        *lock(&self.inner.on_data_loaded) = Some(Arc::new(callback));
    }

    /// Source of the data written by debounced, periodic and `save_now`
    /// writes.
    pub fn set_data_provider(&self, provider: impl Fn() -> Option<NormalizedFileData> + Send + Sync + 'static) {
        *lock(&self.inner.data_provider) = Some(Arc::new(provider));
    }

    /// Install or remove encryption hooks. Replaced hooks drop their cached
    /// key.
    pub fn set_encryption_hooks(&self, hooks: Option<Arc<dyn EncryptionHooks>>) {
        let previous = std::mem::replace(&mut *lock(&self.inner.hooks), hooks);
        if let Some(previous) = previous {
            previous.clear();
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.current()
    }

    pub fn subscribe_status(&self, callback: impl Fn(&StatusSnapshot) + Send + Sync + 'static) -> Subscription {
        self.inner.status.subscribe(callback)
    }

    pub fn watch_status(&self) -> tokio::sync::watch::Receiver<StatusSnapshot> {
        self.inner.status.watch()
    }

    /// Receive every surfaced error except user cancellation.
    pub fn subscribe_errors(&self, callback: impl Fn(&ErrorReport) + Send + Sync + 'static) -> Subscription {
        self.inner.errors.add(callback)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn handle(&self) -> Option<FileHandleReference> {
        self.inner.gate.handle()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.session).is_some()
    }
}

impl EngineInner {
    fn config(&self) -> AutosaveConfig {
        lock(&self.config).clone()
    }

    /// `connected`, or `idle` when background saving is off.
    fn resting_state(&self) -> AutosaveState {
        if lock(&self.config).enabled {
            AutosaveState::Connected
        } else {
            AutosaveState::Idle
        }
    }

    fn scheduler(&self) -> Option<Arc<WriteScheduler>> {
        lock(&self.session)
            .as_ref()
            .map(|session| Arc::clone(&session.scheduler))
    }

    fn session_token(&self) -> Option<(Epoch, CancellationToken)> {
        lock(&self.session)
            .as_ref()
            .map(|session| (session.epoch, session.cancel.clone()))
    }

    fn hooks(&self) -> Option<Arc<dyn EncryptionHooks>> {
        lock(&self.hooks).clone()
    }

    fn teardown(&self) {
        let epoch = self.epochs.advance();
        if let Some(session) = lock(&self.session).take() {
            session.cancel.cancel();
            session.scheduler.stop();
            tracing::debug!(old_epoch = %session.epoch, %epoch, "Session torn down");
        }
        if let Some(hooks) = self.hooks() {
            hooks.clear();
        }
        self.gate.release();
        self.file_encrypted.store(false, Ordering::SeqCst);
    }

    fn report(&self, err: &AutosaveError) {
        let Some(report) = ErrorReport::from_error(err) else {
            return;
        };
        tracing::warn!(kind = ?report.kind, retryable = report.retryable, error = %err, "Autosave error");
        self.errors.emit(&report);
    }

    fn add_pending(&self) {
        self.status.update(|s| s.pending_writes = s.pending_writes.saturating_add(1));
    }

    fn resolve_pending(&self) {
        self.status.update(|s| s.pending_writes = s.pending_writes.saturating_sub(1));
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&lock(&self.config))
    }

    fn park(&self, data: NormalizedFileData, err: &AutosaveError) {
        *lock(&self.parked) = Some(data);
        let permission = self.gate.permission();
        self.status.update(|s| {
            s.status = AutosaveState::Waiting;
            s.message = format!("Waiting for folder access: {err}");
            s.permission_status = permission;
        });
    }

    async fn write_data(&self, data: NormalizedFileData) -> WriteOutcome {
        self.add_pending();
        let outcome = {
            let _guard = self.write_lock.lock().await;
            self.write_locked(data).await
        };
        self.resolve_pending();
        outcome
    }

    async fn write_locked(&self, data: NormalizedFileData) -> WriteOutcome {
        let Some((epoch, cancel)) = self.session_token() else {
            let err = AutosaveError::MissingHandle;
            self.status.update(|s| s.message = err.to_string());
            self.report(&err);
            return WriteOutcome::Failed;
        };
        let Some(handle) = self.gate.handle() else {
            return self.discard(epoch);
        };

        if self.status.current().status == AutosaveState::Waiting {
            *lock(&self.parked) = Some(data);
            tracing::debug!(%epoch, "Write parked while waiting for permission");
            return WriteOutcome::Parked;
        }

        self.status.update(|s| {
            s.status = AutosaveState::Saving;
            s.message = "Saving".to_string();
        });
        let timer = OperationTimer::new("save");

        let bytes = match self.encode(&data).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if !self.epochs.is_current(epoch) {
                    return self.discard(epoch);
                }
                return self.fail(err);
            }
        };
        if !self.epochs.is_current(epoch) {
            return self.discard(epoch);
        }

        let policy = self.retry_policy();
        let gate = &self.gate;
        let epochs = &self.epochs;
        let handle_ref = &handle;
        let payload = bytes.as_slice();
        let result = policy
            .attempt(
                move |attempt| async move {
                    if !epochs.is_current(epoch) {
                        return Err(AutosaveError::Superseded);
                    }
                    tracing::trace!(attempt, file = %handle_ref.file_name(), "Write attempt");
                    gate.write_data(handle_ref, payload).await
                },
                &cancel,
                |status, err| {
                    if matches!(err, AutosaveError::Superseded) {
                        return;
                    }
                    if status.next_delay.is_some() {
                        self.metrics.record_retry();
                    }
                    let retrying = status.next_delay.is_some();
                    let message = format!(
                        "Save attempt {}/{} failed: {}",
                        status.attempt, status.max_attempts, status.reason
                    );
                    self.status.update(|s| {
                        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                        if retrying {
                            s.status = AutosaveState::Retrying;
                            s.message = message;
                        }
                    });
                },
            )
            .await;

        if !self.epochs.is_current(epoch) {
            return self.discard(epoch);
        }

        match result {
            Ok(()) => {
                let elapsed = timer.stop();
                self.metrics.record_success(bytes.len(), elapsed);
                let state = self.resting_state();
                self.status.update(|s| {
                    s.status = state;
                    s.message = "All changes saved".to_string();
                    s.last_save_time = Some(Utc::now());
                    s.consecutive_failures = 0;
                    s.permission_status = PermissionState::Granted;
                });
                tracing::info!(
                    %epoch,
                    bytes = bytes.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Saved data file"
                );
                WriteOutcome::Written
            }
            Err(RetryError::Aborted) | Err(RetryError::Fatal(AutosaveError::Superseded)) => {
                self.discard(epoch)
            }
            Err(RetryError::Fatal(err)) if err.is_permission_loss() => {
                self.metrics.record_failure();
                self.park(data, &err);
                self.report(&err);
                WriteOutcome::Parked
            }
            Err(err) => {
                let exhausted = err.is_exhausted();
                let err = err
                    .into_inner()
                    .unwrap_or_else(|| AutosaveError::Unknown("write failed".to_string()));
                if exhausted {
                    tracing::error!(error = %err, "Save failed after all retries");
                }
                self.fail(err)
            }
        }
    }

    async fn encode(&self, data: &NormalizedFileData) -> Result<Vec<u8>> {
        let document = match self.hooks() {
            Some(hooks) => hooks.encrypt(data).await?,
            None => FileDocument::Plain(data.clone()),
        };
        match &document {
            FileDocument::Encrypted(_) => self.file_encrypted.store(true, Ordering::SeqCst),
            FileDocument::Plain(_) if self.file_encrypted.load(Ordering::SeqCst) => {
                // Refuse to downgrade an encrypted file to plaintext.
                return Err(CryptoError::PasswordRequired.into());
            }
            FileDocument::Plain(_) => {}
        }
        document.to_json_bytes().map_err(AutosaveError::Serialize)
    }

    fn fail(&self, err: AutosaveError) -> WriteOutcome {
        self.metrics.record_failure();
        let permission = self.gate.permission();
        self.status.update(|s| {
            s.status = AutosaveState::Error;
            s.message = err.to_string();
            s.permission_status = permission;
        });
        self.report(&err);
        WriteOutcome::Failed
    }

    fn discard(&self, epoch: Epoch) -> WriteOutcome {
        self.metrics.record_discarded();
        tracing::debug!(%epoch, current = %self.epochs.current(), "Discarding write from a previous session");
        WriteOutcome::Discarded
    }

    /// Run a retried read against the current handle, serialized with writes.
    async fn read_with<F, Fut>(&self, mut read: F) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(FileHandleReference) -> Fut,
        Fut: std::future::Future<Output = Result<Option<Vec<u8>>>>,
    {
        let (epoch, cancel) = self.session_token().ok_or(AutosaveError::MissingHandle)?;
        let handle = self.gate.handle().ok_or(AutosaveError::MissingHandle)?;
        let _guard = self.write_lock.lock().await;
        let _timer = OperationTimer::new("read");

        let result = self
            .retry_policy()
            .attempt(
                |_| read(handle.clone()),
                &cancel,
                |status, err| {
                    tracing::debug!(attempt = status.attempt, error = %err, "Read attempt failed");
                },
            )
            .await;

        if !self.epochs.is_current(epoch) {
            return Err(AutosaveError::Superseded);
        }
        match result {
            Ok(bytes) => Ok(bytes),
            Err(RetryError::Aborted) => Err(AutosaveError::Superseded),
            Err(err) => Err(err
                .into_inner()
                .unwrap_or_else(|| AutosaveError::Unknown("read failed".to_string()))),
        }
    }

    async fn read_current(&self) -> Result<Option<NormalizedFileData>> {
        let gate = &self.gate;
        let result = self
            .read_with(move |handle| async move { gate.read_data(&handle).await })
            .await;
        let result = match result {
            Ok(Some(bytes)) => {
                let name = self.data_file_name();
                self.decode(&bytes, &name, true).await.map(Some)
            }
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => {
                let state = self.resting_state();
                self.status.update(|s| {
                    if matches!(s.status, AutosaveState::Error | AutosaveState::Retrying) {
                        s.status = state;
                        s.message = "Data loaded".to_string();
                    }
                });
            }
            Err(err) => self.handle_read_error(err),
        }
        result
    }

    /// First read of a new session.
    ///
    /// An encrypted data file is flagged before anything can be written, so
    /// a session without a password never replaces it with plaintext. With
    /// an active password the file is opened, which checks the password and
    /// warms the session key.
    async fn inspect_data_file(&self) -> Option<NormalizedFileData> {
        let gate = &self.gate;
        let bytes = match self
            .read_with(move |handle| async move { gate.read_data(&handle).await })
            .await
        {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.handle_read_error(&err);
                return None;
            }
        };

        let name = self.data_file_name();
        let document = match self.parse(&bytes, &name) {
            Ok(document) => document,
            Err(err) => {
                self.handle_read_error(&err);
                return None;
            }
        };
        let password_set = self.hooks().is_some_and(|hooks| hooks.is_active());
        if document.is_encrypted() && !password_set {
            self.file_encrypted.store(true, Ordering::SeqCst);
            tracing::info!(file = %name, "Data file is encrypted; a password is needed to read or save it");
            return None;
        }
        match self.open(document, true).await {
            Ok(data) => Some(data),
            Err(err) => {
                self.handle_read_error(&err);
                None
            }
        }
    }

    fn data_file_name(&self) -> String {
        self.gate
            .handle()
            .map(|handle| handle.file_name().to_string())
            .unwrap_or_default()
    }

    fn parse(&self, bytes: &[u8], name: &str) -> Result<FileDocument> {
        FileDocument::from_slice(bytes).map_err(|source| AutosaveError::CorruptData {
            path: self
                .gate
                .handle()
                .map(|handle| handle.directory().join(name))
                .unwrap_or_else(|| name.into()),
            source,
        })
    }

    /// Parse and, if needed, decrypt a document. `connected_file` marks the
    /// connected data file as encrypted when it is.
    async fn decode(&self, bytes: &[u8], name: &str, connected_file: bool) -> Result<NormalizedFileData> {
        let document = self.parse(bytes, name)?;
        self.open(document, connected_file).await
    }

    async fn open(&self, document: FileDocument, connected_file: bool) -> Result<NormalizedFileData> {
        match document {
            FileDocument::Plain(data) => Ok(data),
            FileDocument::Encrypted(payload) => {
                if connected_file {
                    self.file_encrypted.store(true, Ordering::SeqCst);
                }
                let hooks = self.hooks().ok_or(CryptoError::PasswordRequired)?;
                Ok(hooks.decrypt(&payload).await?)
            }
        }
    }

    fn handle_read_error(&self, err: &AutosaveError) {
        match err {
            AutosaveError::Superseded => {}
            err if err.is_permission_loss() => {
                let permission = self.gate.permission();
                self.status.update(|s| {
                    s.status = AutosaveState::Waiting;
                    s.message = format!("Waiting for folder access: {err}");
                    s.permission_status = permission;
                });
                self.report(err);
            }
            AutosaveError::MissingHandle => self.report(err),
            err => {
                self.status.update(|s| {
                    s.status = AutosaveState::Error;
                    s.message = err.to_string();
                });
                self.report(err);
            }
        }
    }
}

#[async_trait]
impl WriteSink for EngineInner {
    async fn flush(&self, reason: SaveReason) -> FlushOutcome {
        let provider = lock(&self.data_provider).clone();
        let Some(data) = provider.and_then(|provider| provider()) else {
            tracing::debug!(reason = reason.as_str(), "No data provider; nothing to flush");
            return FlushOutcome::Flushed;
        };
        let started = Instant::now();
        let outcome = self.write_data(data).await;
        tracing::debug!(
            reason = reason.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flush finished"
        );
        match outcome {
            WriteOutcome::Written => FlushOutcome::Flushed,
            WriteOutcome::Parked | WriteOutcome::Discarded => FlushOutcome::Deferred,
            WriteOutcome::Failed => FlushOutcome::Failed,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
