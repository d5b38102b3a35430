//! Ambient stack shared by every `foreman-*` crate: telemetry init and
//! environment-driven configuration loading.

pub mod config;
pub mod telemetry;

pub use config::EngineConfig;
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
