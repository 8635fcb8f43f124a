//! Telemetry for the enrichment pipeline.
//!
//! Metrics are kept in-process as atomic counters; backend health is tracked
//! per storage kind and surfaced in logs at shutdown.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
