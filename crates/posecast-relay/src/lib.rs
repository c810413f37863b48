//! posecast relay server: receives device telemetry, answers pose frames
//! with coaching feedback and pushes workout metrics.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Feedback templates and simulated workout metrics.
pub mod coach;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Operator command console.
pub mod console;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics, health and device listing endpoints.
pub mod metrics;
/// Device id → connection table.
pub mod registry;
/// Accept loop, metrics ticker and shared server state.
pub mod server;

pub use registry::DeviceTarget;
pub use server::{run, run_with_shutdown, RelayState};
