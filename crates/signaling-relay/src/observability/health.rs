//! Health endpoints for the signaling relay.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (is the WebSocket listener accepting?)
//! - `GET /metrics` - Prometheus text, when a handle is supplied
//!
//! # Health State
//!
//! The `HealthState` tracks:
//! - `live`: Always true after startup (process is running)
//! - `ready`: True once the WebSocket listener is bound, false again as soon
//!   as shutdown begins

use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health state for the signaling relay.
///
/// Tracks liveness and readiness for Kubernetes probes.
#[derive(Debug)]
pub struct HealthState {
    /// Whether the service is live (process running).
    /// Always true after startup initialization.
    live: AtomicBool,
    /// Whether the service is ready to accept WebSocket connections.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark the service as ready to serve traffic.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Check if the service is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
///
/// # Endpoints
///
/// - `GET /health` - Returns 200 if process is running (liveness)
/// - `GET /ready` - Returns 200 if ready to serve traffic, 503 otherwise (readiness)
/// - `GET /metrics` - Prometheus text format (only when `prometheus` is `Some`)
pub fn health_router(
    health_state: Arc<HealthState>,
    prometheus: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state);

    match prometheus {
        Some(handle) => router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        None => router,
    }
}

/// Liveness probe handler.
///
/// Returns 200 OK if the process is running.
/// Kubernetes uses this to determine if the pod should be restarted.
async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness probe handler.
///
/// Returns 200 OK if the service is ready to serve traffic.
/// Returns 503 Service Unavailable if not ready.
/// Kubernetes uses this to determine if the pod should receive traffic.
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
