//! Metrics collection and export for Tribecast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tribecast_core::BrokerStats;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tribecast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tribecast_connections_active";
    pub const EVENTS_TOTAL: &str = "tribecast_events_streamed_total";
    pub const EVENTS_BYTES: &str = "tribecast_events_streamed_bytes";
    pub const LISTENERS_ACTIVE: &str = "tribecast_listeners_active";
    pub const GROUPS_ACTIVE: &str = "tribecast_groups_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "tribecast_upstream_subscriptions_active";
    pub const EVENTS_DROPPED: &str = "tribecast_events_dropped";
    pub const DECODE_FAILURES: &str = "tribecast_decode_failures";
    pub const UNKNOWN_VARIANTS: &str = "tribecast_unknown_variants";
    pub const UPSTREAM_ERRORS: &str = "tribecast_upstream_errors";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of SSE connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open SSE connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events streamed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of events streamed");
    metrics::describe_gauge!(names::LISTENERS_ACTIVE, "Registered broker listeners");
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Groups with at least one listener");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Active upstream subscriptions"
    );
    metrics::describe_gauge!(names::EVENTS_DROPPED, "Events dropped on full listener queues");
    metrics::describe_gauge!(names::DECODE_FAILURES, "Upstream records that failed to decode");
    metrics::describe_gauge!(
        names::UNKNOWN_VARIANTS,
        "Upstream records with an unknown discriminant"
    );
    metrics::describe_gauge!(names::UPSTREAM_ERRORS, "Upstream subscribe or read failures");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a streamed event.
pub fn record_event(bytes: usize) {
    counter!(names::EVENTS_TOTAL).increment(1);
    counter!(names::EVENTS_BYTES).increment(bytes as u64);
}

/// Publish a broker statistics sample as gauges.
pub fn record_broker_stats(stats: &BrokerStats) {
    gauge!(names::LISTENERS_ACTIVE).set(stats.listeners as f64);
    gauge!(names::GROUPS_ACTIVE).set(stats.groups as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.active_subscriptions as f64);
    gauge!(names::EVENTS_DROPPED).set(stats.events_dropped as f64);
    gauge!(names::DECODE_FAILURES).set(stats.decode_failures as f64);
    gauge!(names::UNKNOWN_VARIANTS).set(stats.unknown_variants as f64);
    gauge!(names::UPSTREAM_ERRORS).set(stats.upstream_errors as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
