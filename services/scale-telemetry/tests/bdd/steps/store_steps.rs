//! BDD step definitions for the telemetry store feature

use std::time::Duration;

use cucumber::{given, then, when};

use scale_telemetry::TelemetryStore;

use crate::world::{reading, TelemetryWorld};

/// Weights delivered to `subscriber`, in arrival order
fn received_by(world: &TelemetryWorld, subscriber: &str) -> Vec<f64> {
    world
        .deliveries
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| name == subscriber)
        .map(|(_, weight)| *weight)
        .collect()
}

/// Deliveries may come from a background connection task, so give them time
async fn wait_for_deliveries(world: &TelemetryWorld, subscriber: &str, count: usize) {
    for _ in 0..200 {
        if received_by(world, subscriber).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[given("an empty telemetry store")]
fn empty_store(world: &mut TelemetryWorld) {
    world.store = TelemetryStore::new();
}

#[given(expr = "subscriber {string} follows device {string}")]
fn subscriber_follows(world: &mut TelemetryWorld, subscriber: String, device_id: String) {
    let deliveries = world.deliveries.clone();
    let name = subscriber.clone();
    let subscription = world.store.subscribe(&device_id, move |snapshot| {
        deliveries
            .lock()
            .unwrap()
            .push((name.clone(), snapshot.net_weight));
    });
    world.subscriptions.insert(subscriber, subscription);
}

#[given(expr = "subscriber {string} follows device {string} but fails on every update")]
fn failing_subscriber(world: &mut TelemetryWorld, subscriber: String, device_id: String) {
    let subscription = world.store.subscribe(&device_id, |snapshot| {
        panic!("display for {} crashed", snapshot.device_id);
    });
    world.subscriptions.insert(subscriber, subscription);
}

#[given(expr = "a reading of {float} kg arrived for device {string}")]
fn reading_arrived(world: &mut TelemetryWorld, net_weight: f64, device_id: String) {
    world.store.record_and_dispatch(&reading(&device_id, net_weight));
}

#[when(expr = "a reading of {float} kg arrives for device {string}")]
fn reading_arrives(world: &mut TelemetryWorld, net_weight: f64, device_id: String) {
    world.store.record_and_dispatch(&reading(&device_id, net_weight));
}

#[when(expr = "subscriber {string} unsubscribes")]
fn subscriber_unsubscribes(world: &mut TelemetryWorld, subscriber: String) {
    let subscription = world
        .subscriptions
        .get_mut(&subscriber)
        .expect("unknown subscriber");
    subscription.unsubscribe();
}

#[when("the store is reset")]
fn store_reset(world: &mut TelemetryWorld) {
    world.store.reset();
}

#[then(expr = "the latest net weight for device {string} should be {float}")]
fn latest_weight(world: &mut TelemetryWorld, device_id: String, expected: f64) {
    let latest = world
        .store
        .get_latest(&device_id)
        .expect("no cached reading");
    assert_eq!(latest.net_weight, expected);
    assert_eq!(latest.device_id, device_id);
}

#[then(expr = "device {string} should have no cached reading")]
fn no_cached_reading(world: &mut TelemetryWorld, device_id: String) {
    assert!(world.store.get_latest(&device_id).is_none());
}

#[then(expr = "{int} devices should be cached")]
fn devices_cached(world: &mut TelemetryWorld, count: usize) {
    assert_eq!(world.store.device_count(), count);
}

#[then(expr = "subscriber {string} should have received {float} then {float}")]
async fn received_two(world: &mut TelemetryWorld, subscriber: String, first: f64, second: f64) {
    wait_for_deliveries(world, &subscriber, 2).await;
    assert_eq!(received_by(world, &subscriber), vec![first, second]);
}

#[then(expr = "subscriber {string} should have received only {float}")]
async fn received_one(world: &mut TelemetryWorld, subscriber: String, weight: f64) {
    wait_for_deliveries(world, &subscriber, 1).await;
    assert_eq!(received_by(world, &subscriber), vec![weight]);
}

#[then(expr = "subscriber {string} should have received nothing")]
fn received_nothing(world: &mut TelemetryWorld, subscriber: String) {
    let received = received_by(world, &subscriber);
    assert!(
        received.is_empty(),
        "Expected no updates for {}, but found {:?}",
        subscriber,
        received
    );
}

#[then(expr = "subscriber {string} should no longer be registered")]
fn not_registered(world: &mut TelemetryWorld, subscriber: String) {
    let subscription = world
        .subscriptions
        .get(&subscriber)
        .expect("unknown subscriber");
    assert!(!subscription.is_active());
}
