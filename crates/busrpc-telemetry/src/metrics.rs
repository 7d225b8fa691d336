//! Prometheus metrics for busrpc clients and servers.
//!
//! All metrics follow the naming convention: `busrpc_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // CLIENT METRICS
    // =========================================================================

    /// Requests published by clients
    pub static ref REQUESTS_SENT: CounterVec = CounterVec::new(
        Opts::new("busrpc_requests_sent_total", "Requests published by clients"),
        &["method", "kind"]  // kind: unary/multi/stream
    ).expect("metric creation failed");

    /// Client call latency, publish to final outcome
    pub static ref CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("busrpc_call_duration_seconds", "Client call duration")
            .buckets(exponential_buckets(0.0005, 2.0, 14).expect("valid buckets")),
        &["method"]
    ).expect("metric creation failed");

    // =========================================================================
    // SERVER METRICS
    // =========================================================================

    /// Requests handled by servers
    pub static ref REQUESTS_HANDLED: CounterVec = CounterVec::new(
        Opts::new("busrpc_requests_handled_total", "Requests handled by servers"),
        &["method", "outcome"]  // outcome: ok or an error code
    ).expect("metric creation failed");

    /// Claim negotiation outcomes, as seen by the side recording them
    pub static ref CLAIMS: CounterVec = CounterVec::new(
        Opts::new("busrpc_claims_total", "Claim negotiation outcomes"),
        &["outcome"]  // selected/declined/lost/timeout/unavailable
    ).expect("metric creation failed");

    // =========================================================================
    // STREAM METRICS
    // =========================================================================

    /// Stream frames by direction
    pub static ref STREAM_FRAMES: CounterVec = CounterVec::new(
        Opts::new("busrpc_stream_frames_total", "Stream data frames"),
        &["direction"]  // sent/received
    ).expect("metric creation failed");
}

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let mut result = Ok(());
    REGISTER.call_once(|| {
        let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(REQUESTS_SENT.clone()),
            Box::new(CALL_DURATION.clone()),
            Box::new(REQUESTS_HANDLED.clone()),
            Box::new(CLAIMS.clone()),
            Box::new(STREAM_FRAMES.clone()),
        ];
        for metric in metrics {
            if let Err(e) = REGISTRY.register(metric) {
                result = Err(TelemetryError::MetricsInit(e.to_string()));
                return;
            }
        }
    });
    result
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard observing a labelled histogram on drop.
pub struct HistogramTimer {
    histogram: prometheus::Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    pub fn new(histogram: &HistogramVec, labels: &[&str]) -> Self {
        Self {
            histogram: histogram.with_label_values(labels),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
