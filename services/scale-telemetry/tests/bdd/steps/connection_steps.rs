//! BDD step definitions for connection lifecycle feature

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when};

use scale_telemetry::{
    ConnectionConfig, ConnectionManager, ReadyState, TelemetryContext, TransportClient,
};

use crate::world::{reading, TelemetryWorld, TestConnector};

fn test_config(max_reconnect_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://scales.test/ws".to_string(),
        reconnect_interval_ms: 10,
        max_reconnect_attempts,
    }
}

fn connector(world: &TelemetryWorld) -> Arc<TestConnector> {
    world.connector.clone().expect("endpoint not set")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[given("a telemetry endpoint that refuses connections")]
fn refusing_endpoint(world: &mut TelemetryWorld) {
    world.connector = Some(Arc::new(TestConnector::refusing()));
}

#[given("a telemetry endpoint that accepts connections")]
fn accepting_endpoint(world: &mut TelemetryWorld) {
    world.connector = Some(Arc::new(TestConnector::reachable()));
}

#[given(expr = "the endpoint streams readings of {float} then {float} kg for device {string}")]
fn endpoint_streams(world: &mut TelemetryWorld, first: f64, second: f64, device_id: String) {
    let connector = connector(world);
    let mut frames = connector.frames.lock().unwrap();
    for weight in [first, second] {
        frames.push_back(serde_json::to_string(&reading(&device_id, weight)).unwrap());
    }
}

#[given(expr = "a client allowed {int} reconnect attempts")]
fn client_with_budget(world: &mut TelemetryWorld, attempts: u32) {
    let client = TransportClient::with_connector(test_config(attempts), connector(world));
    let closes = world.close_events.clone();
    client.on_close(move || {
        closes.fetch_add(1, Ordering::SeqCst);
    });
    world.client = Some(client);
}

#[given("a telemetry context on that endpoint")]
fn context_on_endpoint(world: &mut TelemetryWorld) {
    let context = TelemetryContext::with_connector(connector(world));
    world.store = context.store().clone();
    world.context = Some(context);
}

#[when("the client connects")]
async fn client_connects(world: &mut TelemetryWorld) {
    world.client.as_ref().expect("client not set").connect();
    settle().await;
}

#[when("the client disconnects")]
async fn client_disconnects(world: &mut TelemetryWorld) {
    world.client.as_ref().expect("client not set").disconnect();
    settle().await;
}

#[when("the client sends a ping")]
async fn client_sends_ping(world: &mut TelemetryWorld) {
    world
        .client
        .as_ref()
        .expect("client not set")
        .send(&serde_json::json!({ "type": "ping" }));
    settle().await;
}

#[when("the telemetry context starts")]
async fn context_starts(world: &mut TelemetryWorld) {
    world
        .context
        .as_ref()
        .expect("context not set")
        .start(test_config(0));
    settle().await;
}

#[when("the telemetry context shuts down")]
fn context_shuts_down(world: &mut TelemetryWorld) {
    world.context.as_ref().expect("context not set").shutdown();
}

#[when("the connection manager is initialized twice")]
async fn manager_initialized_twice(world: &mut TelemetryWorld) {
    let manager = ConnectionManager::with_connector(connector(world));
    manager.initialize(test_config(0));
    manager.initialize(test_config(0));
    settle().await;
    world.manager = Some(manager);
}

#[then(expr = "the endpoint should have seen {int} connection attempts")]
async fn connection_attempts(world: &mut TelemetryWorld, expected: usize) {
    // let any remaining retries run out before counting
    settle().await;
    assert_eq!(connector(world).connect_count(), expected);
}

#[then(expr = "{int} close events should have fired")]
fn close_events(world: &mut TelemetryWorld, expected: usize) {
    assert_eq!(world.close_events.load(Ordering::SeqCst), expected);
}

#[then(expr = "the client should be {word}")]
fn client_state(world: &mut TelemetryWorld, state: String) {
    let expected = match state.as_str() {
        "open" => ReadyState::Open,
        "closed" => ReadyState::Closed,
        other => panic!("Unknown state: {}", other),
    };
    let client = world.client.as_ref().expect("client not set");
    assert_eq!(client.ready_state(), expected);
}

#[then(expr = "the endpoint should have received {int} frames")]
fn frames_received(world: &mut TelemetryWorld, expected: usize) {
    assert_eq!(connector(world).sent.lock().unwrap().len(), expected);
}

#[then(expr = "the manager should have created {int} clients")]
fn clients_created(world: &mut TelemetryWorld, expected: usize) {
    let manager = world.manager.as_ref().expect("manager not set");
    assert_eq!(manager.clients_created(), expected);
}

#[then("only the latest client should be open")]
fn only_latest_open(world: &mut TelemetryWorld) {
    let manager = world.manager.as_ref().expect("manager not set");
    let client = manager.client().expect("no live client");
    assert_eq!(client.ready_state(), ReadyState::Open);
}

#[then(expr = "the telemetry context should have processed {int} messages")]
fn messages_processed(world: &mut TelemetryWorld, expected: u64) {
    let context = world.context.as_ref().expect("context not set");
    assert_eq!(context.messages_processed(), expected);
}
