//! Scale Telemetry
//!
//! Real-time telemetry distribution for a fleet of weighing-scale devices:
//! a reconnecting WebSocket transport, a latest-snapshot cache with
//! per-device fan-out, and consumer subscriptions on top of it. A stand-in
//! backend (device fleet, metric generator, REST and WebSocket endpoints)
//! lives in [`mock`].

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod io;
pub mod manager;
pub mod mock;
pub mod rest;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::{load_config, Config, ConnectionConfig};
pub use context::TelemetryContext;
pub use error::{Result, TelemetryError};
pub use hooks::{AllMetricsPoller, DeviceSubscription, DevicesSubscription, SnapshotMap};
pub use manager::ConnectionManager;
pub use store::{Subscription, TelemetryStore};
pub use transport::{ListenerId, ReadyState, TransportClient};
pub use wire::{DeviceStatus, MessageKind, TelemetrySnapshot, WireMessage};
