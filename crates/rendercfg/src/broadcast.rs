//! Live rendering settings with per-key change notification.
//!
//! Values sit behind an `RwLock`, so a pass reading a setting never observes
//! a half-applied change. Listeners run synchronously on the thread that
//! performed the change, in registration order for a given key. A listener
//! that returns an error or panics is logged and skipped; the rest still run.
//!
//! Threads other than the render thread can instead queue changes through a
//! [`SettingsRemote`]; the render loop drains the queue with
//! [`Settings::apply_pending`] before evaluating node conditions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{ConfigError, RenderingConfig, SettingKey, SettingValue};

/// Failure reported by a setting listener.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A single effective change delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingChange {
    pub key: SettingKey,
    pub previous: SettingValue,
    pub current: SettingValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SettingChange) -> Result<(), ListenerError> + Send + Sync>;

struct ListenerEntry {
    id: SubscriptionId,
    key: SettingKey,
    callback: Listener,
}

struct Shared {
    values: RwLock<RenderingConfig>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_id: AtomicU64,
    pending_tx: Sender<(SettingKey, SettingValue)>,
    pending_rx: Receiver<(SettingKey, SettingValue)>,
}

impl Shared {
    fn listeners(&self) -> MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide rendering settings. Cloning shares the same state.
#[derive(Clone)]
pub struct Settings {
    shared: Arc<Shared>,
}

impl Settings {
    pub fn new(initial: RenderingConfig) -> Self {
        let (pending_tx, pending_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                values: RwLock::new(initial),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                pending_tx,
                pending_rx,
            }),
        }
    }

    fn values(&self) -> RwLockReadGuard<'_, RenderingConfig> {
        self.shared
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> RenderingConfig {
        self.values().clone()
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        self.values().get(key)
    }

    /// Reads a boolean setting; numeric keys read as `false`.
    pub fn bool(&self, key: SettingKey) -> bool {
        self.get(key).as_bool().unwrap_or(false)
    }

    pub fn float(&self, key: SettingKey) -> Option<f32> {
        self.get(key).as_float()
    }

    /// Registers `listener` for changes to `key`. The listener stays
    /// registered until the returned [`Subscription`] is dropped or cancelled.
    pub fn subscribe<F>(&self, key: SettingKey, listener: F) -> Subscription
    where
        F: Fn(&SettingChange) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners().push(ListenerEntry {
            id,
            key,
            callback: Arc::new(listener),
        });
        tracing::trace!(%key, subscription = id.0, "registered setting listener");
        Subscription {
            id,
            key,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn listener_count(&self, key: SettingKey) -> usize {
        self.shared
            .listeners()
            .iter()
            .filter(|entry| entry.key == key)
            .count()
    }

    /// Applies `value` and notifies listeners of `key` if it changed.
    ///
    /// Returns `Ok(false)` when the value was already current; no
    /// notification is sent in that case.
    pub fn set(&self, key: SettingKey, value: SettingValue) -> Result<bool, ConfigError> {
        let previous = {
            let mut values = self
                .shared
                .values
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            values.set(key, value)?
        };
        if previous == value {
            return Ok(false);
        }

        let change = SettingChange {
            key,
            previous,
            current: value,
        };
        let callbacks: Vec<(SubscriptionId, Listener)> = self
            .shared
            .listeners()
            .iter()
            .filter(|entry| entry.key == key)
            .map(|entry| (entry.id, Arc::clone(&entry.callback)))
            .collect();

        tracing::debug!(%key, %previous, current = %value, listeners = callbacks.len(), "setting changed");
        for (id, callback) in callbacks {
            notify(id, &callback, &change);
        }
        Ok(true)
    }

    /// Returns a handle other threads can use to queue changes for the
    /// render thread.
    pub fn remote(&self) -> SettingsRemote {
        SettingsRemote {
            tx: self.shared.pending_tx.clone(),
        }
    }

    /// Applies every queued remote change in arrival order and returns how
    /// many of them changed a value. Invalid changes are logged and dropped.
    pub fn apply_pending(&self) -> usize {
        let pending: Vec<_> = self.shared.pending_rx.try_iter().collect();
        let mut applied = 0;
        for (key, value) in pending {
            match self.set(key, value) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%key, %value, %error, "discarding queued setting change");
                }
            }
        }
        applied
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(RenderingConfig::default())
    }
}

fn notify(id: SubscriptionId, callback: &Listener, change: &SettingChange) {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(change))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(
                key = %change.key,
                subscription = id.0,
                %error,
                "setting listener failed; continuing with remaining listeners"
            );
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::warn!(
                key = %change.key,
                subscription = id.0,
                panic = %message,
                "setting listener panicked; continuing with remaining listeners"
            );
        }
    }
}

/// Queues setting changes for the render thread.
#[derive(Clone)]
pub struct SettingsRemote {
    tx: Sender<(SettingKey, SettingValue)>,
}

impl SettingsRemote {
    /// Queues a change. Returns `false` if the settings have been dropped.
    pub fn set(&self, key: SettingKey, value: SettingValue) -> bool {
        self.tx.send((key, value)).is_ok()
    }
}

/// Registration handle returned by [`Settings::subscribe`].
#[must_use = "dropping a subscription unregisters its listener"]
pub struct Subscription {
    id: SubscriptionId,
    key: SettingKey,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> SettingKey {
        self.key
    }

    /// Unregisters the listener now.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners().retain(|entry| entry.id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}
