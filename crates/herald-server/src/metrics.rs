//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const STREAMS_TOTAL: &str = "herald_streams_total";
    pub const STREAMS_ACTIVE: &str = "herald_streams_active";
    pub const SUBSCRIBERS_ACTIVE: &str = "herald_subscribers_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "herald_subscriptions_total";
    pub const DELIVERIES_TOTAL: &str = "herald_deliveries_total";
    pub const DELIVERED_BYTES: &str = "herald_delivered_bytes";
    pub const DELIVERY_SECONDS: &str = "herald_delivery_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::STREAMS_TOTAL,
        "Total number of subscriber streams since server start"
    );
    metrics::describe_gauge!(names::STREAMS_ACTIVE, "Current number of open streams");
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of registered subscribers"
    );
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Total number of subscriptions");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Total delivery attempts by outcome");
    metrics::describe_counter!(names::DELIVERED_BYTES, "Total payload bytes delivered");
    metrics::describe_histogram!(
        names::DELIVERY_SECONDS,
        "Time a producer waited for its message to be consumed"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the registered subscriber count.
pub fn set_active_subscribers(count: usize) {
    gauge!(names::SUBSCRIBERS_ACTIVE).set(count as f64);
}

/// Record a delivery attempt.
pub fn record_delivery(outcome: &'static str, bytes: usize, seconds: f64) {
    counter!(names::DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::DELIVERY_SECONDS).record(seconds);
    if outcome == "ok" {
        counter!(names::DELIVERED_BYTES).increment(bytes as u64);
    }
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that tracks an open stream until dropped.
pub struct StreamMetricsGuard;

impl StreamMetricsGuard {
    /// Create a new metrics guard, recording an opened stream.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::STREAMS_TOTAL).increment(1);
        gauge!(names::STREAMS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for StreamMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::STREAMS_ACTIVE).decrement(1.0);
    }
}
