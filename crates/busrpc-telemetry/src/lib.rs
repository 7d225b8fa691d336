//! # busrpc Telemetry
//!
//! Logging and metrics for busrpc processes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use busrpc_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     init_telemetry(&TelemetryConfig::from_env()).expect("Failed to init telemetry");
//!     // Clients and servers now log through `tracing` and count into REGISTRY
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BUSRPC_SERVICE_NAME` | `busrpc` | Service name in logs |
//! | `BUSRPC_LOG_LEVEL` | `info` | Log level filter |
//! | `BUSRPC_JSON_LOGS` | `false` | JSON log output |
//! | `BUSRPC_METRICS` | `true` | Register Prometheus metrics |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, init_test_logging};
pub use metrics::{
    encode_metrics, register_metrics, HistogramTimer, CALL_DURATION, CLAIMS, REGISTRY,
    REQUESTS_HANDLED, REQUESTS_SENT, STREAM_FRAMES,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),
}

/// Initialize logging and, if enabled, metrics.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if config.metrics_enabled {
        register_metrics()?;
    }
    init_logging(config)
}
