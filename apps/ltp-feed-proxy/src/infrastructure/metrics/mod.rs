//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Prices**: Updates by source, deliveries, drops and failed deliveries
//! - **Upstream**: Command failures, reconnects, primary connection state
//! - **Fallback**: Fetch outcomes and latency, poller restarts
//! - **Registry**: Client, subscription and fallback target counts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market::PriceSource;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return its handle.
///
/// Later calls return the already-installed handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "ltp_proxy_price_updates_total",
        "Price updates applied to the registry by source"
    );
    describe_counter!(
        "ltp_proxy_deliveries_total",
        "Price ticks published to client connections"
    );
    describe_counter!(
        "ltp_proxy_delivery_failures_total",
        "Client connections removed after their receiver went away"
    );

    describe_counter!(
        "ltp_proxy_upstream_failures_total",
        "Upstream subscribe/unsubscribe requests abandoned after retries"
    );
    describe_counter!(
        "ltp_proxy_reconnects_total",
        "Primary feed reconnection attempts"
    );
    describe_gauge!(
        "ltp_proxy_primary_connected",
        "Whether the primary feed is connected (1) or not (0)"
    );

    describe_counter!(
        "ltp_proxy_fallback_fetches_total",
        "Fallback price lookups by outcome"
    );
    describe_histogram!(
        "ltp_proxy_fallback_fetch_seconds",
        "Latency of fallback price lookups"
    );
    describe_counter!(
        "ltp_proxy_poller_restarts_total",
        "Fallback poller restarts issued by the supervisor"
    );

    describe_gauge!("ltp_proxy_clients", "Registered client connections");
    describe_gauge!(
        "ltp_proxy_subscriptions",
        "Instruments with at least one interested client"
    );
    describe_gauge!(
        "ltp_proxy_fallback_targets",
        "Subscribed instruments currently served by the fallback source"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a fallback lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A price was returned.
    Hit,
    /// The source answered without usable data or failed.
    Miss,
}

impl FetchOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// Record a price update applied to the registry.
pub fn record_price_update(source: PriceSource) {
    counter!(
        "ltp_proxy_price_updates_total",
        "source" => source.as_str()
    )
    .increment(1);
}

/// Record ticks published to client connections.
pub fn record_deliveries(source: PriceSource, count: u64) {
    counter!(
        "ltp_proxy_deliveries_total",
        "source" => source.as_str()
    )
    .increment(count);
}

/// Record a connection removed after its channel closed.
pub fn record_delivery_failure() {
    counter!("ltp_proxy_delivery_failures_total").increment(1);
}

/// Record an abandoned upstream request.
pub fn record_upstream_failure(method: &'static str) {
    counter!(
        "ltp_proxy_upstream_failures_total",
        "method" => method
    )
    .increment(1);
}

/// Record a primary feed reconnection attempt.
pub fn record_reconnect() {
    counter!("ltp_proxy_reconnects_total").increment(1);
}

/// Update the primary connection gauge.
pub fn set_primary_connected(connected: bool) {
    gauge!("ltp_proxy_primary_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a fallback lookup and its latency.
pub fn record_fallback_fetch(outcome: FetchOutcome, duration: Duration) {
    counter!(
        "ltp_proxy_fallback_fetches_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("ltp_proxy_fallback_fetch_seconds").record(duration.as_secs_f64());
}

/// Record a supervisor-issued poller restart.
pub fn record_poller_restart() {
    counter!("ltp_proxy_poller_restarts_total").increment(1);
}

/// Update the registry size gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_registry_sizes(clients: usize, subscriptions: usize, fallback_targets: usize) {
    gauge!("ltp_proxy_clients").set(clients as f64);
    gauge!("ltp_proxy_subscriptions").set(subscriptions as f64);
    gauge!("ltp_proxy_fallback_targets").set(fallback_targets as f64);
}

// =============================================================================
// Tests
// =============================================================================
