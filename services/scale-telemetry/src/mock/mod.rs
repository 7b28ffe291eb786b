//! Stand-in telemetry backend
//!
//! A fixed fleet of simulated scales, a metric generator with smooth
//! transitions, and an axum server exposing the WebSocket stream together
//! with the device and auth REST endpoints. Used by the `mock_scales` binary
//! and by the end-to-end tests.

mod devices;
mod generator;
mod server;

pub use devices::{find_device, fleet, DEVICE_TYPE};
pub use generator::MetricsGenerator;
pub use server::{build_router, MockServer, MockServerState};
