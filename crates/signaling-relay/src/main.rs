//! Signaling Relay
//!
//! WebSocket relay that lets clients in the same room exchange the messages
//! needed to set up peer-to-peer media sessions.
//!
//! # Servers
//!
//! - WebSocket endpoint `GET /ws` (default: 0.0.0.0:8080)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the participant store (Redis, or disabled when `REDIS_URL` is unset)
//! 4. Build the credential verifier
//! 5. Initialize actor system (`RoomRegistryHandle`)
//! 6. Start health HTTP server (liveness, readiness, metrics)
//! 7. Start WebSocket server
//! 8. Wait for shutdown signal
//!
//! # Shutdown Flow
//!
//! 1. Readiness flips to 503
//! 2. Every live connection closes with going-away and runs its cleanup
//! 3. Actor system is cancelled

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use signaling_relay::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
use signaling_relay::auth::{AuthVerifier, JwtAuthVerifier};
use signaling_relay::config::Config;
use signaling_relay::dispatcher::Dispatcher;
use signaling_relay::observability::{health_router, init_metrics_recorder, HealthState};
use signaling_relay::store::{DisabledStore, ParticipantStore, RedisParticipantStore};
use signaling_relay::transport::{relay_router, ConnectionSettings, RelayState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for live connections to close after the shutdown signal.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while draining connections.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed for the server tasks to stop.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first; it decides the log format
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "signaling_relay=debug,tower_http=debug".into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Signaling Relay");
    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        room_capacity = config.room_capacity,
        rate_limit_max_messages = config.rate_limit_max_messages,
        rate_limit_window_seconds = config.rate_limit_window.as_secs(),
        max_message_bytes = config.max_message_bytes,
        auth_timeout_seconds = config.auth_timeout.as_secs(),
        store_enabled = config.redis_url.is_some(),
        "Configuration loaded"
    );

    // Initialize Prometheus metrics recorder
    // MUST be done before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to initialize Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Participant store
    let store: Arc<dyn ParticipantStore> = match &config.redis_url {
        Some(redis_url) => {
            info!("Connecting to Redis...");
            let store = RedisParticipantStore::connect(redis_url).await.map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            info!("Redis connection established");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, participant mirroring disabled");
            Arc::new(DisabledStore)
        }
    };

    // Credential verifier
    let verifier: Arc<dyn AuthVerifier> = Arc::new(
        JwtAuthVerifier::from_public_key_jwk(&config.jwt_public_key, config.jwt_clock_skew)
            .map_err(|e| {
                error!(error = %e, "Failed to build credential verifier");
                e
            })?,
    );

    // Actor system
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        RoomSettings {
            capacity: config.room_capacity,
            store_timeout: config.store_timeout,
        },
        store,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Server shutdown token; connections watch it to close with going-away
    let shutdown_token = CancellationToken::new();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_state = Arc::new(HealthState::new());
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    // Start WebSocket server
    let ws_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;
    let relay_state = RelayState {
        dispatcher: Dispatcher::new(registry.clone(), verifier),
        metrics: Arc::clone(&actor_metrics),
        settings: ConnectionSettings::from_config(&config),
        shutdown: shutdown_token.clone(),
    };
    let ws_app = relay_router(relay_state).layer(TraceLayer::new_for_http());

    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await.map_err(|e| {
        error!(error = %e, addr = %ws_addr, "Failed to bind WebSocket server");
        format!("Failed to bind WebSocket server to {ws_addr}: {e}")
    })?;
    info!(addr = %ws_addr, "WebSocket server bound successfully");

    let ws_shutdown_token = shutdown_token.child_token();
    let ws_task = tokio::spawn(async move {
        let server = axum::serve(
            ws_listener,
            ws_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });
    info!(addr = %ws_addr, "WebSocket server started");

    health_state.set_ready();

    // Wait for shutdown signal
    info!("Signaling Relay running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Every connection closes with going-away and leaves its room
    shutdown_token.cancel();
    drain_connections(&actor_metrics).await;

    for (name, task) in [("websocket", ws_task), ("health", health_task)] {
        if tokio::time::timeout(SERVER_STOP_TIMEOUT, task).await.is_err() {
            warn!(server = name, "Server did not stop in time");
        }
    }

    // Cancels every room and any connection writer still running
    registry.cancel();

    info!("Signaling Relay shutdown complete");
    Ok(())
}

/// Wait until every connection writer has stopped, or the drain deadline.
async fn drain_connections(metrics: &ActorMetrics) {
    let deadline = tokio::time::Instant::now() + CONNECTION_DRAIN_TIMEOUT;

    while metrics.connection_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                remaining = metrics.connection_count(),
                "Connection drain timed out"
            );
            return;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }

    info!("All connections closed");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
