//! Prometheus Metrics Module
//!
//! Exposes monitor metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Mark price ticks received, dropped and processed
//! - **Stops**: Stop-loss replacements by outcome and their latency
//! - **Registry**: Refresh outcomes, tracked positions, active subscriptions
//! - **Connection**: Stream connection state, reconnect attempts, credential renewals
//! - **Notifications**: Queue depth and messages enqueued, delivered, dropped
//!
//! Recording functions are no-ops until a recorder is installed, so services
//! can be exercised in tests without initializing metrics.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// A non-zero `port` serves `/metrics` on `0.0.0.0:<port>`; with `0` the
/// recorder is installed without a listener and can be rendered through
/// [`get_metrics_handle`].
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot bind.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    if port == 0 {
        let handle = PrometheusBuilder::new().install_recorder()?;
        let _ = PROMETHEUS_HANDLE.set(handle);
    } else {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()?;
    }

    register_metrics();
    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` unless metrics were initialized without a listener.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ticks
    describe_counter!("position_monitor_ticks_received_total", "Mark price ticks received from the stream");
    describe_counter!(
        "position_monitor_ticks_dropped_total",
        "Mark price ticks dropped because the tick queue was full"
    );
    describe_counter!("position_monitor_ticks_processed_total", "Mark price observations evaluated");

    // Stops
    describe_counter!("position_monitor_stop_updates_total", "Stop-loss replacements by outcome");
    describe_histogram!(
        "position_monitor_order_replacement_seconds",
        "Time to cancel and replace a protective stop"
    );

    // Registry
    describe_counter!("position_monitor_refreshes_total", "Registry refreshes by outcome");
    describe_gauge!("position_monitor_positions", "Positions currently tracked");
    describe_gauge!("position_monitor_subscriptions", "Symbols with confirmed stream subscriptions");

    // Connection
    describe_gauge!(
        "position_monitor_connection_state",
        "Stream connection state (0 disconnected, 1 connecting, 2 connected, 3 degraded, -1 gave up)"
    );
    describe_counter!("position_monitor_reconnect_attempts_total", "Failed stream connection attempts");
    describe_counter!(
        "position_monitor_credential_renewals_total",
        "Session credential renewals by outcome"
    );

    // Notifications
    describe_gauge!("position_monitor_notification_queue_depth", "Notifications waiting for delivery");
    describe_counter!("position_monitor_notifications_enqueued_total", "Notifications queued by kind");
    describe_counter!("position_monitor_notifications_delivered_total", "Notifications delivered by kind");
    describe_counter!(
        "position_monitor_notifications_dropped_total",
        "Notifications evicted from a full queue by kind"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a tick received from the stream.
pub fn record_tick_received() {
    counter!("position_monitor_ticks_received_total").increment(1);
}

/// Record a tick dropped on a full queue.
pub fn record_tick_dropped() {
    counter!("position_monitor_ticks_dropped_total").increment(1);
}

/// Record a tick evaluated by the monitor.
pub fn record_tick_processed() {
    counter!("position_monitor_ticks_processed_total").increment(1);
}

/// Record a stop replacement outcome.
pub fn record_stop_update(outcome: &'static str) {
    counter!("position_monitor_stop_updates_total", "outcome" => outcome).increment(1);
}

/// Record how long a stop replacement took.
pub fn record_order_replacement_latency(duration: Duration) {
    histogram!("position_monitor_order_replacement_seconds").record(duration.as_secs_f64());
}

/// Record a refresh outcome.
pub fn record_refresh(outcome: &'static str) {
    counter!("position_monitor_refreshes_total", "outcome" => outcome).increment(1);
}

/// Update the tracked position count.
#[allow(clippy::cast_precision_loss)]
pub fn set_monitored_positions(count: usize) {
    gauge!("position_monitor_positions").set(count as f64);
}

/// Update the subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("position_monitor_subscriptions").set(count as f64);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("position_monitor_connection_state").set(state.as_gauge());
}

/// Record a failed connection attempt.
pub fn record_reconnect_attempt() {
    counter!("position_monitor_reconnect_attempts_total").increment(1);
}

/// Record a credential renewal outcome.
pub fn record_credential_renewal(outcome: &'static str) {
    counter!("position_monitor_credential_renewals_total", "outcome" => outcome).increment(1);
}

/// Update the notification queue depth.
#[allow(clippy::cast_precision_loss)]
pub fn set_notification_queue_depth(depth: usize) {
    gauge!("position_monitor_notification_queue_depth").set(depth as f64);
}

/// Record a queued notification.
pub fn record_notification_enqueued(kind: &'static str) {
    counter!("position_monitor_notifications_enqueued_total", "kind" => kind).increment(1);
}

/// Record a delivered notification.
pub fn record_notification_delivered(kind: &'static str) {
    counter!("position_monitor_notifications_delivered_total", "kind" => kind).increment(1);
}

/// Record a notification evicted from a full queue.
pub fn record_notification_dropped(kind: &'static str) {
    counter!("position_monitor_notifications_dropped_total", "kind" => kind).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_tick_received();
        record_stop_update("raised");
        set_connection_state(ConnectionState::Connected);
        record_order_replacement_latency(Duration::from_millis(40));
        assert!(get_metrics_handle().is_none());
    }
}
