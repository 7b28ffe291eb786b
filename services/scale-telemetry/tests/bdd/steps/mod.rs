//! BDD step definitions for scale-telemetry

pub mod connection_steps;
pub mod store_steps;
