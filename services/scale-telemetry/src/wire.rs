//! Telemetry snapshot and wire message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating status reported by a scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Idle,
    Error,
    Maintenance,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Active => write!(f, "active"),
            DeviceStatus::Idle => write!(f, "idle"),
            DeviceStatus::Error => write!(f, "error"),
            DeviceStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Latest known measurement set for one device
///
/// `net_weight = gross_weight - tare_weight` is expected from the producer
/// but never checked here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Total weight including tare (kg)
    pub gross_weight: f64,
    /// Container/platform weight (kg)
    pub tare_weight: f64,
    /// Product weight (kg)
    pub net_weight: f64,
    pub status: DeviceStatus,
    /// Reading has settled
    pub is_stable: bool,
    pub load_cell_count: u32,
    /// Samples per second
    pub measuring_speed: u32,
    /// Degrees Celsius, when a sensor is fitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Legacy alias for `net_weight`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

impl TelemetrySnapshot {
    /// Weight to show on a display: the legacy field when present, else net
    pub fn display_weight(&self) -> f64 {
        self.weight.unwrap_or(self.net_weight)
    }
}

/// Kind of an inbound wire message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Metrics,
    Status,
    Error,
}

/// Envelope carried over the telemetry socket, one per device per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: TelemetrySnapshot,
}

impl WireMessage {
    /// Wrap a snapshot in a `metrics` envelope stamped now
    pub fn metrics(data: TelemetrySnapshot) -> Self {
        Self {
            kind: MessageKind::Metrics,
            device_id: data.device_id.clone(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Control-channel messages exchanged outside the telemetry stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ping,
    Pong { timestamp: DateTime<Utc> },
}

/// Decode one inbound text frame
pub fn decode_frame(text: &str) -> crate::Result<WireMessage> {
    Ok(serde_json::from_str(text)?)
}
