//! Consumer-facing subscriptions on top of [`TelemetryStore`]
//!
//! Each type publishes into a `tokio::sync::watch` channel so readers can
//! either sample the latest value or await changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{Subscription, TelemetryStore};
use crate::wire::TelemetrySnapshot;

pub type SnapshotMap = HashMap<String, Arc<TelemetrySnapshot>>;

/// Live view of one device
///
/// Holds exactly one store registration for the current device id.
pub struct DeviceSubscription {
    store: TelemetryStore,
    device_id: String,
    sender: Arc<watch::Sender<Option<Arc<TelemetrySnapshot>>>>,
    receiver: watch::Receiver<Option<Arc<TelemetrySnapshot>>>,
    subscription: Option<Subscription>,
}

impl DeviceSubscription {
    pub fn new(store: &TelemetryStore, device_id: impl Into<String>) -> Self {
        let (sender, receiver) = watch::channel(None);
        let mut this = Self {
            store: store.clone(),
            device_id: device_id.into(),
            sender: Arc::new(sender),
            receiver,
            subscription: None,
        };
        this.attach();
        this
    }

    fn attach(&mut self) {
        let sender = self.sender.clone();
        self.subscription = Some(self.store.subscribe(&self.device_id, move |snapshot| {
            sender.send_replace(Some(snapshot.clone()));
        }));
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.receiver.borrow().clone()
    }

    /// Receiver that is notified on every update for this device
    pub fn watch(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.receiver.clone()
    }

    /// Follow a different device; no-op when the id is unchanged
    pub fn set_device(&mut self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        if device_id == self.device_id {
            return;
        }
        debug!("Switching subscription '{}' -> '{}'", self.device_id, device_id);
        self.subscription = None;
        self.sender.send_replace(None);
        self.device_id = device_id;
        self.attach();
    }
}

/// Live view of a set of devices, keyed by device id
pub struct DevicesSubscription {
    store: TelemetryStore,
    device_ids: Vec<String>,
    sender: Arc<watch::Sender<SnapshotMap>>,
    receiver: watch::Receiver<SnapshotMap>,
    subscriptions: Vec<Subscription>,
}

impl DevicesSubscription {
    pub fn new<I, S>(store: &TelemetryStore, device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (sender, receiver) = watch::channel(SnapshotMap::new());
        let mut this = Self {
            store: store.clone(),
            device_ids: dedup(device_ids),
            sender: Arc::new(sender),
            receiver,
            subscriptions: Vec::new(),
        };
        this.attach();
        this
    }

    fn attach(&mut self) {
        for device_id in &self.device_ids {
            let sender = self.sender.clone();
            let key = device_id.clone();
            let subscription = self.store.subscribe(device_id, move |snapshot| {
                sender.send_modify(|map| {
                    map.insert(key.clone(), snapshot.clone());
                });
            });
            self.subscriptions.push(subscription);
        }
    }

    pub fn device_ids(&self) -> &[String] {
        &self.device_ids
    }

    pub fn latest(&self) -> SnapshotMap {
        self.receiver.borrow().clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<TelemetrySnapshot>> {
        self.receiver.borrow().get(device_id).cloned()
    }

    pub fn watch(&self) -> watch::Receiver<SnapshotMap> {
        self.receiver.clone()
    }

    /// Replace the watched set; no-op when the list is unchanged
    ///
    /// Entries for devices that are no longer watched are removed.
    pub fn set_devices<I, S>(&mut self, device_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let device_ids = dedup(device_ids);
        if device_ids == self.device_ids {
            return;
        }

        self.subscriptions.clear();
        self.sender
            .send_modify(|map| map.retain(|id, _| device_ids.contains(id)));
        self.device_ids = device_ids;
        self.attach();
    }
}

fn dedup<I, S>(device_ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut unique: Vec<String> = Vec::new();
    for id in device_ids {
        let id = id.into();
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

/// Periodic copy of the whole cache
///
/// Poll based on purpose: fleet overviews refresh at a fixed rate instead of
/// on every frame.
pub struct AllMetricsPoller {
    receiver: watch::Receiver<SnapshotMap>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AllMetricsPoller {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    /// Start polling `store` every `interval`. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(store: TelemetryStore, interval: Duration) -> Self {
        let (sender, receiver) = watch::channel(store.get_all_latest());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let next = store.get_all_latest();
                        sender.send_if_modified(|current| {
                            if same_snapshots(current, &next) {
                                false
                            } else {
                                *current = next;
                                true
                            }
                        });
                    }
                }
            }
            debug!("All-metrics poller stopped");
        });

        Self {
            receiver,
            cancel,
            handle,
        }
    }

    pub fn latest(&self) -> SnapshotMap {
        self.receiver.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SnapshotMap> {
        self.receiver.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for AllMetricsPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn same_snapshots(a: &SnapshotMap, b: &SnapshotMap) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(id, snapshot)| b.get(id).is_some_and(|other| Arc::ptr_eq(snapshot, other)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{DeviceStatus, MessageKind, WireMessage};
    use chrono::Utc;

    fn message(device_id: &str, net_weight: f64) -> WireMessage {
        WireMessage {
            kind: MessageKind::Metrics,
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            data: TelemetrySnapshot {
                device_id: device_id.to_string(),
                timestamp: Utc::now(),
                gross_weight: net_weight + 5.0,
                tare_weight: 5.0,
                net_weight,
                status: DeviceStatus::Idle,
                is_stable: false,
                load_cell_count: 2,
                measuring_speed: 1600,
                temperature: Some(21.0),
                weight: None,
                battery_level: None,
                humidity: None,
            },
        }
    }

    #[test]
    fn device_subscription_starts_with_cached_value() {
        let store = TelemetryStore::new();
        store.record_and_dispatch(&message("S-1", 3.0));

        let sub = DeviceSubscription::new(&store, "S-1");

        assert_eq!(sub.latest().unwrap().net_weight, 3.0);
        assert_eq!(store.subscriber_count("S-1"), 1);
    }

    #[test]
    fn device_subscription_follows_updates() {
        let store = TelemetryStore::new();
        let sub = DeviceSubscription::new(&store, "S-1");
        assert!(sub.latest().is_none());

        store.record_and_dispatch(&message("S-1", 1.0));
        store.record_and_dispatch(&message("S-2", 9.0));

        assert_eq!(sub.latest().unwrap().net_weight, 1.0);
    }

    #[tokio::test]
    async fn device_subscription_watch_is_notified() {
        let store = TelemetryStore::new();
        let sub = DeviceSubscription::new(&store, "S-1");
        let mut rx = sub.watch();

        store.record_and_dispatch(&message("S-1", 2.5));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().net_weight, 2.5);
    }

    #[test]
    fn set_device_resubscribes_only_on_change() {
        let store = TelemetryStore::new();
        store.record_and_dispatch(&message("S-2", 8.0));
        let mut sub = DeviceSubscription::new(&store, "S-1");

        sub.set_device("S-1");
        assert_eq!(store.subscriber_count("S-1"), 1);

        sub.set_device("S-2");
        assert_eq!(store.subscriber_count("S-1"), 0);
        assert_eq!(store.subscriber_count("S-2"), 1);
        assert_eq!(sub.device_id(), "S-2");
        assert_eq!(sub.latest().unwrap().net_weight, 8.0);
    }

    #[test]
    fn dropping_device_subscription_releases_registration() {
        let store = TelemetryStore::new();
        let sub = DeviceSubscription::new(&store, "S-1");
        drop(sub);

        assert_eq!(store.subscriber_count("S-1"), 0);
    }

    #[test]
    fn devices_subscription_collects_each_device() {
        let store = TelemetryStore::new();
        store.record_and_dispatch(&message("A", 1.0));
        let sub = DevicesSubscription::new(&store, ["A", "B", "A"]);

        assert_eq!(sub.device_ids(), ["A".to_string(), "B".to_string()]);
        assert_eq!(store.subscriber_count("A"), 1);
        assert_eq!(sub.latest().len(), 1);

        store.record_and_dispatch(&message("B", 2.0));
        store.record_and_dispatch(&message("C", 3.0));

        let latest = sub.latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(sub.get("B").unwrap().net_weight, 2.0);
        assert!(sub.get("C").is_none());
    }

    #[test]
    fn set_devices_drops_unwatched_entries() {
        let store = TelemetryStore::new();
        store.record_and_dispatch(&message("A", 1.0));
        store.record_and_dispatch(&message("B", 2.0));
        let mut sub = DevicesSubscription::new(&store, ["A", "B"]);
        assert_eq!(sub.latest().len(), 2);

        sub.set_devices(["B", "C"]);

        assert!(sub.get("A").is_none());
        assert_eq!(sub.get("B").unwrap().net_weight, 2.0);
        assert_eq!(store.subscriber_count("A"), 0);
        assert_eq!(store.subscriber_count("B"), 1);
        assert_eq!(store.subscriber_count("C"), 1);
    }

    #[test]
    fn set_devices_with_same_list_keeps_registrations() {
        let store = TelemetryStore::new();
        let mut sub = DevicesSubscription::new(&store, vec!["A".to_string()]);
        sub.set_devices(vec!["A".to_string()]);

        assert_eq!(store.subscriber_count("A"), 1);
    }

    #[tokio::test]
    async fn poller_publishes_cache_copies() {
        let store = TelemetryStore::new();
        let poller = AllMetricsPoller::spawn(store.clone(), Duration::from_millis(20));
        let mut rx = poller.watch();
        assert!(poller.latest().is_empty());

        store.record_and_dispatch(&message("A", 1.0));
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(poller.latest().len(), 1);
        assert!(poller.is_running());
    }

    #[tokio::test]
    async fn poller_stops_on_request() {
        let store = TelemetryStore::new();
        let poller = AllMetricsPoller::spawn(store, Duration::from_millis(10));

        poller.stop();
        tokio::time::timeout(Duration::from_secs(1), async {
            while poller.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
