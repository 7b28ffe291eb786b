//! BDD test world for scale-telemetry

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use cucumber::World;
use scale_telemetry::io::{ConnectionPair, Connector, FrameReader, FrameWriter};
use scale_telemetry::{
    ConnectionManager, DeviceStatus, Subscription, TelemetryContext, TelemetryError,
    TelemetrySnapshot, TelemetryStore, TransportClient, WireMessage,
};

/// Deliveries in arrival order: (subscriber name, net weight)
pub type Deliveries = Arc<Mutex<Vec<(String, f64)>>>;

#[derive(Debug, Default, World)]
pub struct TelemetryWorld {
    // Store testing
    pub store: TelemetryStore,
    pub subscriptions: HashMap<String, Subscription>,
    pub deliveries: Deliveries,

    // Connection testing
    pub connector: Option<Arc<TestConnector>>,
    pub client: Option<TransportClient>,
    pub close_events: Arc<AtomicUsize>,
    pub manager: Option<ConnectionManager>,
    pub context: Option<TelemetryContext>,
}

/// Metrics envelope for `device_id` carrying `net_weight`
pub fn reading(device_id: &str, net_weight: f64) -> WireMessage {
    WireMessage::metrics(TelemetrySnapshot {
        device_id: device_id.to_string(),
        timestamp: Utc::now(),
        gross_weight: net_weight + 25.0,
        tare_weight: 25.0,
        net_weight,
        status: DeviceStatus::Active,
        is_stable: true,
        load_cell_count: 2,
        measuring_speed: 1600,
        temperature: Some(20.5),
        weight: None,
        battery_level: None,
        humidity: None,
    })
}

/// Connector standing in for the telemetry endpoint
///
/// When reachable, every connection first yields the queued frames and then
/// stays open without further traffic.
#[derive(Debug, Default)]
pub struct TestConnector {
    pub reachable: bool,
    pub frames: Mutex<VecDeque<String>>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub connects: AtomicUsize,
}

impl TestConnector {
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

struct QueuedReader {
    frames: VecDeque<String>,
}

#[async_trait]
impl FrameReader for QueuedReader {
    async fn read_frame(&mut self) -> scale_telemetry::Result<Option<String>> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => std::future::pending().await,
        }
    }
}

struct RecordingWriter {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FrameWriter for RecordingWriter {
    async fn write_frame(&mut self, text: &str) -> scale_telemetry::Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&mut self) -> scale_telemetry::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, url: &str) -> scale_telemetry::Result<ConnectionPair> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Err(TelemetryError::ConnectionFailed(format!(
                "Failed to connect to {}: refused",
                url
            )));
        }

        let frames = std::mem::take(&mut *self.frames.lock().unwrap());
        Ok(ConnectionPair {
            reader: Box::new(QueuedReader { frames }),
            writer: Box::new(RecordingWriter {
                sent: self.sent.clone(),
            }),
        })
    }
}
