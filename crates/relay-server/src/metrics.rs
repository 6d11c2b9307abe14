//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_APPENDED: &str = "relay_messages_appended_total";
    pub const DUPLICATES_TOTAL: &str = "relay_duplicates_total";
    pub const STORAGE_FAILURES: &str = "relay_storage_failures_total";
    pub const MESSAGES_DELIVERED: &str = "relay_messages_delivered_total";
    pub const BUS_UNAVAILABLE: &str = "relay_bus_unavailable_total";
    pub const REPLAY_FAILURES: &str = "relay_replay_failures_total";
    pub const LATENCY_SECONDS: &str = "relay_inbound_latency_seconds";
}

/// Delivery phase label.
#[derive(Debug, Clone, Copy)]
pub enum Phase {
    Replay,
    Live,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Replay => "replay",
            Phase::Live => "live",
        }
    }
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_APPENDED, "Messages written to the log");
    metrics::describe_counter!(
        names::DUPLICATES_TOTAL,
        "Submissions acknowledged as duplicates"
    );
    metrics::describe_counter!(
        names::STORAGE_FAILURES,
        "Submissions withheld because the log write failed"
    );
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED,
        "Messages delivered to clients, by phase"
    );
    metrics::describe_counter!(
        names::BUS_UNAVAILABLE,
        "Publishes that only reached this process"
    );
    metrics::describe_counter!(names::REPLAY_FAILURES, "Replays aborted by a log error");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound message handling latency in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message appended to the log.
pub fn record_appended() {
    counter!(names::MESSAGES_APPENDED).increment(1);
}

/// Record a duplicate submission.
pub fn record_duplicate() {
    counter!(names::DUPLICATES_TOTAL).increment(1);
}

/// Record a withheld submission.
pub fn record_storage_failure() {
    counter!(names::STORAGE_FAILURES).increment(1);
}

/// Record a publish that could not leave this process.
pub fn record_bus_unavailable() {
    counter!(names::BUS_UNAVAILABLE).increment(1);
}

/// Record a message delivered to a client.
pub fn record_delivery(phase: Phase) {
    counter!(names::MESSAGES_DELIVERED, "phase" => phase.as_str()).increment(1);
}

/// Record an aborted replay.
pub fn record_replay_failure() {
    counter!(names::REPLAY_FAILURES).increment(1);
}

/// Record inbound handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
