//! Metrics definitions for the signaling relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Store latency buckets
/// cover the default 2s write timeout.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("relay_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection & Room Metrics (Gauges)
// ============================================================================

/// Set the number of open WebSocket connections.
///
/// Metric: `relay_connections_active`
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Set the number of non-empty rooms.
///
/// Metric: `relay_rooms_active`
pub fn set_rooms_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_rooms_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `relay_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Traffic Metrics (Counters)
// ============================================================================

/// Record a join attempt.
///
/// Metric: `relay_joins_total`
/// Labels: `result` (`success` or a `RelayError` label)
pub fn record_join(result: &str) {
    counter!("relay_joins_total", "result" => result.to_string()).increment(1);
}

/// Record a processed client message.
///
/// Metric: `relay_messages_total`
/// Labels: `message_type`
pub fn record_message(message_type: &str) {
    counter!("relay_messages_total", "message_type" => message_type.to_string()).increment(1);
}

/// Record a closed connection.
///
/// Metric: `relay_connections_closed_total`
/// Labels: `reason` (normal, going_away, binary_unsupported, message_too_large,
/// auth_timeout, auth_failed, rate_limited, peer_closed)
pub fn record_connection_closed(reason: &str) {
    counter!("relay_connections_closed_total", "reason" => reason.to_string()).increment(1);
}

/// Record an outbound frame dropped because a mailbox was full or closed.
///
/// Metric: `relay_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("relay_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `relay_actor_panics_total`
/// Labels: `actor_type`
///
/// Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("relay_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Store Metrics
// ============================================================================

/// Record a participant store operation.
///
/// Metrics: `relay_store_latency_seconds`, `relay_store_errors_total`
/// Labels: `operation` (`add_participant`, `update_mic_status`,
/// `remove_participant`, `remove_room`)
pub fn record_store_operation(operation: &str, duration: Duration, success: bool) {
    histogram!("relay_store_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());

    if !success {
        counter!("relay_store_errors_total", "operation" => operation.to_string()).increment(1);
    }
}
