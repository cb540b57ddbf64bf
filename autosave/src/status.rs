//! Live status gauge and error notifications.
//!
//! One [`StatusSnapshot`] per engine, replaced wholesale on every transition.
//! Observers either register a callback (returning a [`Subscription`] that
//! unsubscribes on drop) or hold a `watch::Receiver`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{AutosaveError, ErrorKind};
use crate::retry::RetryClassifiable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutosaveState {
    /// Connected with background saving turned off.
    Idle,
    Connecting,
    Connected,
    Saving,
    /// Folder permission lost; writes are parked until it is re-granted.
    Waiting,
    Retrying,
    Error,
    Disconnected,
}

impl AutosaveState {
    pub fn as_str(self) -> &'static str {
        match self {
            AutosaveState::Idle => "idle",
            AutosaveState::Connecting => "connecting",
            AutosaveState::Connected => "connected",
            AutosaveState::Saving => "saving",
            AutosaveState::Waiting => "waiting",
            AutosaveState::Retrying => "retrying",
            AutosaveState::Error => "error",
            AutosaveState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for AutosaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: AutosaveState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub permission_status: PermissionState,
    pub last_save_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub pending_writes: u32,
}

impl StatusSnapshot {
    pub fn disconnected() -> Self {
        Self {
            status: AutosaveState::Disconnected,
            message: "Not connected".to_string(),
            timestamp: Utc::now(),
            permission_status: PermissionState::Prompt,
            last_save_time: None,
            consecutive_failures: 0,
            pending_writes: 0,
        }
    }
}

/// A surfaced error, as delivered to error listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    /// `None` for user cancellation, which is never reported.
    pub fn from_error(err: &AutosaveError) -> Option<Self> {
        let kind = err.kind();
        if kind == ErrorKind::UserCancelled {
            return None;
        }
        Some(Self {
            kind,
            message: err.to_string(),
            retryable: err.is_retryable(),
            timestamp: Utc::now(),
        })
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubscriberList<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Callback registry shared by status and error notifications.
pub(crate) struct Subscribers<T> {
    inner: Arc<Mutex<SubscriberList<T>>>,
}

impl<T: 'static> Subscribers<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubscriberList {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut list = lock(&self.inner);
            let id = list.next_id;
            list.next_id += 1;
            list.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<SubscriberList<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).entries.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Snapshot of the current callbacks. Invoked outside the lock so a
    /// callback may unsubscribe itself.
    pub(crate) fn callbacks(&self) -> Vec<Callback<T>> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub(crate) fn emit(&self, value: &T) {
        for callback in self.callbacks() {
            callback(value);
        }
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.run();
    }

    /// Keep the callback registered for the lifetime of the publisher.
    pub fn detach(mut self) {
        self.remove.take();
    }

    fn run(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
    subscribers: Subscribers<StatusSnapshot>,
    sequence: AtomicU64,
    publish_lock: Mutex<()>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(StatusSnapshot::disconnected())
    }
}

impl StatusPublisher {
    pub fn new(initial: StatusSnapshot) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            subscribers: Subscribers::new(),
            sequence: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot and notify subscribers.
    pub fn publish(&self, next: StatusSnapshot) {
        let seq = {
            let _guard = lock(&self.publish_lock);
            self.tx.send_replace(next.clone());
            self.sequence.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.deliver(seq, &next);
    }

    /// Apply `change` to a copy of the current snapshot, stamp it, and
    /// publish the result.
    pub fn update(&self, change: impl FnOnce(&mut StatusSnapshot)) -> StatusSnapshot {
        let (seq, next) = {
            let _guard = lock(&self.publish_lock);
            let mut next = self.tx.borrow().clone();
            change(&mut next);
            next.timestamp = Utc::now();
            self.tx.send_replace(next.clone());
            (self.sequence.fetch_add(1, Ordering::SeqCst) + 1, next)
        };
        self.deliver(seq, &next);
        next
    }

    fn deliver(&self, seq: u64, snapshot: &StatusSnapshot) {
        for callback in self.subscribers.callbacks() {
            // A newer snapshot was published meanwhile; its own delivery
            // supersedes this one.
            if self.sequence.load(Ordering::SeqCst) != seq {
                return;
            }
            callback(snapshot);
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&StatusSnapshot) + Send + Sync + 'static) -> Subscription {
        self.subscribers.add(callback)
    }

    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
