//! Configuration types for the scale telemetry service

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: MockServerConfig,
}

/// Telemetry socket settings
///
/// Field names follow the JSON shape used by the dashboard
/// (`url`, `reconnectInterval`, `maxReconnectAttempts`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Fixed delay between reconnection attempts, in milliseconds
    #[serde(default = "default_reconnect_interval", rename = "reconnectInterval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    /// Connection settings for `url` with default retry policy
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Consumer-side subscription settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Snapshot period of the "all metrics" poller
    #[serde(default = "default_all_metrics_poll")]
    pub all_metrics_poll_ms: u64,
    /// Devices to watch; empty means every device the REST API lists
    #[serde(default)]
    pub devices: Vec<String>,
}

impl SubscriptionConfig {
    pub fn all_metrics_poll_interval(&self) -> Duration {
        Duration::from_millis(self.all_metrics_poll_ms)
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            all_metrics_poll_ms: default_all_metrics_poll(),
            devices: Vec::new(),
        }
    }
}

/// Device/auth REST collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            username: None,
            password: None,
        }
    }
}

/// Stand-in telemetry server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Period between metric broadcasts for the whole fleet
    #[serde(default = "default_stream_interval")]
    pub stream_interval_ms: u64,
    #[serde(default = "default_fleet_size")]
    pub fleet_size: usize,
}

impl MockServerConfig {
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            stream_interval_ms: default_stream_interval(),
            fleet_size: default_fleet_size(),
        }
    }
}

fn default_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_all_metrics_poll() -> u64 {
    100
}

fn default_api_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_stream_interval() -> u64 {
    300
}

fn default_fleet_size() -> usize {
    10
}

/// Load configuration from a JSON file
pub fn load_config(path: &Path) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::TelemetryError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}
