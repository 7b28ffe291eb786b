//! Latest-snapshot cache and per-device fan-out
//!
//! The cache and the subscriber registry live behind a single reentrant lock.
//! Dispatch holds it for the whole "update cache, then notify" sequence, so
//! readers on other threads see either none or all of an update, and an
//! `unsubscribe` from another thread cannot return while that callback is
//! still running. Callbacks may call back into the store (subscribe,
//! unsubscribe, read) from inside a notification.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, error};

use crate::error::panic_message;
use crate::wire::{TelemetrySnapshot, WireMessage};

/// Callback invoked with the newest snapshot of one device
pub type SnapshotCallback = Arc<dyn Fn(&Arc<TelemetrySnapshot>) + Send + Sync>;

#[derive(Default)]
struct StoreState {
    cache: HashMap<String, Arc<TelemetrySnapshot>>,
    /// device id -> token -> callback; token order is registration order
    registry: HashMap<String, BTreeMap<u64, SnapshotCallback>>,
    /// never reset, so a stale handle can't remove a newer registration
    next_token: u64,
}

type Inner = ReentrantMutex<RefCell<StoreState>>;

/// Shared telemetry cache with per-device subscriptions
#[derive(Clone, Default)]
pub struct TelemetryStore {
    inner: Arc<Inner>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `message.data` for its device, then notify that device's subscribers
    ///
    /// Subscribers are called in registration order. A panicking callback is
    /// logged and does not prevent the remaining callbacks from running.
    pub fn record_and_dispatch(&self, message: &WireMessage) {
        let guard = self.inner.lock();
        let device_id = message.device_id.as_str();
        let snapshot = Arc::new(message.data.clone());

        let callbacks: Vec<(u64, SnapshotCallback)> = {
            let mut state = guard.borrow_mut();
            state.cache.insert(device_id.to_string(), snapshot.clone());
            match state.registry.get(device_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(token, callback)| (*token, callback.clone()))
                    .collect(),
                None => return,
            }
        };

        for (token, callback) in callbacks {
            // an earlier callback may have unsubscribed this one
            let still_registered = guard
                .borrow()
                .registry
                .get(device_id)
                .is_some_and(|subscribers| subscribers.contains_key(&token));
            if still_registered {
                invoke(device_id, &callback, &snapshot);
            }
        }
    }

    /// Register `callback` for `device_id`
    ///
    /// If a snapshot is already cached, the callback receives it once before
    /// this returns. The registration lasts until the returned handle is
    /// unsubscribed or dropped, or the store is reset.
    pub fn subscribe<F>(&self, device_id: &str, callback: F) -> Subscription
    where
        F: Fn(&Arc<TelemetrySnapshot>) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(callback);
        let guard = self.inner.lock();

        let (token, cached) = {
            let mut state = guard.borrow_mut();
            state.next_token += 1;
            let token = state.next_token;
            state
                .registry
                .entry(device_id.to_string())
                .or_default()
                .insert(token, callback.clone());
            (token, state.cache.get(device_id).cloned())
        };
        debug!("Subscribed to device '{}' (token {})", device_id, token);

        if let Some(snapshot) = cached {
            invoke(device_id, &callback, &snapshot);
        }
        drop(guard);

        Subscription {
            store: Some(Arc::downgrade(&self.inner)),
            device_id: device_id.to_string(),
            token,
        }
    }

    /// Most recent snapshot for `device_id`, if any has been received
    pub fn get_latest(&self, device_id: &str) -> Option<Arc<TelemetrySnapshot>> {
        self.inner.lock().borrow().cache.get(device_id).cloned()
    }

    /// Point-in-time copy of the whole cache
    pub fn get_all_latest(&self) -> HashMap<String, Arc<TelemetrySnapshot>> {
        self.inner.lock().borrow().cache.clone()
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.inner
            .lock()
            .borrow()
            .registry
            .get(device_id)
            .map_or(0, BTreeMap::len)
    }

    /// Number of devices with a cached snapshot
    pub fn device_count(&self) -> usize {
        self.inner.lock().borrow().cache.len()
    }

    /// Drop every cached snapshot and every registration
    ///
    /// Callbacks are dropped after the state borrow ends, so a callback that
    /// owns a [`Subscription`] can release it from its own destructor.
    pub fn reset(&self) {
        let guard = self.inner.lock();
        let (cache, registry) = {
            let mut state = guard.borrow_mut();
            debug!(
                "Resetting telemetry store ({} devices, {} subscribed devices)",
                state.cache.len(),
                state.registry.len()
            );
            (
                std::mem::take(&mut state.cache),
                std::mem::take(&mut state.registry),
            )
        };
        drop(registry);
        drop(cache);
    }
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        let state = guard.borrow();
        f.debug_struct("TelemetryStore")
            .field("devices", &state.cache.len())
            .field("subscribed_devices", &state.registry.len())
            .finish()
    }
}

fn invoke(device_id: &str, callback: &SnapshotCallback, snapshot: &Arc<TelemetrySnapshot>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
        error!(
            "Subscriber for device '{}' panicked: {}",
            device_id,
            panic_message(payload.as_ref())
        );
    }
}

/// Handle for one store registration
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Option<Weak<Inner>>,
    device_id: String,
    token: u64,
}

impl Subscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the registration is still present in the store
    pub fn is_active(&self) -> bool {
        let Some(inner) = self.store.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        let guard = inner.lock();
        let state = guard.borrow();
        state
            .registry
            .get(&self.device_id)
            .is_some_and(|subscribers| subscribers.contains_key(&self.token))
    }

    /// Remove this registration; further calls do nothing
    pub fn unsubscribe(&mut self) {
        let Some(inner) = self.store.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let guard = inner.lock();
        // dropped only after the borrow ends; the callback may own another handle
        let (removed, emptied) = {
            let mut state = guard.borrow_mut();
            let Some(subscribers) = state.registry.get_mut(&self.device_id) else {
                return;
            };
            let removed = subscribers.remove(&self.token);
            let emptied = if subscribers.is_empty() {
                state.registry.remove(&self.device_id)
            } else {
                None
            };
            (removed, emptied)
        };

        if removed.is_some() {
            debug!(
                "Unsubscribed from device '{}' (token {})",
                self.device_id, self.token
            );
        }
        drop(emptied);
        drop(removed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("device_id", &self.device_id)
            .field("token", &self.token)
            .finish()
    }
}
