//! Test server harness for end-to-end testing.
//!
//! Provides `TestRelayServer` for spawning a real relay (actor system plus
//! the axum WebSocket endpoint) on a random port.

use crate::mock_auth::MockAuthVerifier;
use crate::mock_store::MockParticipantStore;
use signaling_relay::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
use signaling_relay::auth::AuthVerifier;
use signaling_relay::dispatcher::Dispatcher;
use signaling_relay::session::RateLimitConfig;
use signaling_relay::store::ParticipantStore;
use signaling_relay::transport::{relay_router, ConnectionSettings, RelayState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Harness errors.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to bind test server: {0}")]
    Bind(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

/// Relay configuration for a test server.
#[derive(Clone)]
pub struct TestRelayOptions {
    pub settings: ConnectionSettings,
    pub room_capacity: usize,
    pub store_timeout: Duration,
    pub store: Arc<dyn ParticipantStore>,
    pub verifier: Arc<dyn AuthVerifier>,
}

impl Default for TestRelayOptions {
    fn default() -> Self {
        Self {
            settings: ConnectionSettings {
                auth_timeout: Duration::from_secs(10),
                rate_limit: RateLimitConfig {
                    window: Duration::from_secs(10),
                    max_messages: 120,
                },
                max_message_bytes: 64 * 1024,
                outbound_buffer: 256,
            },
            room_capacity: 8,
            store_timeout: Duration::from_secs(2),
            store: Arc::new(MockParticipantStore::new()),
            verifier: Arc::new(MockAuthVerifier::new()),
        }
    }
}

impl TestRelayOptions {
    #[must_use]
    pub fn with_store(mut self, store: impl ParticipantStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: impl AuthVerifier + 'static) -> Self {
        self.verifier = Arc::new(verifier);
        self
    }

    #[must_use]
    pub fn with_room_capacity(mut self, capacity: usize) -> Self {
        self.room_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.settings.auth_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, max_messages: u32, window: Duration) -> Self {
        self.settings.rate_limit = RateLimitConfig {
            window,
            max_messages,
        };
        self
    }

    #[must_use]
    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.settings.max_message_bytes = max;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

/// Real relay server bound to `127.0.0.1:0`.
///
/// # Example
/// ```rust,ignore
/// let server = TestRelayServer::spawn(TestRelayOptions::default()).await?;
/// let mut client = TestClient::connect(&server.url()).await?;
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a server with `options`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Bind` if no local port is available.
    pub async fn spawn(options: TestRelayOptions) -> Result<Self, HarnessError> {
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            RoomSettings {
                capacity: options.room_capacity,
                store_timeout: options.store_timeout,
            },
            options.store,
            Arc::clone(&metrics),
        );
        let shutdown = CancellationToken::new();

        let app = relay_router(RelayState {
            dispatcher: Dispatcher::new(registry.clone(), options.verifier),
            metrics: Arc::clone(&metrics),
            settings: options.settings,
            shutdown: shutdown.clone(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| HarnessError::Bind(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::Bind(e.to_string()))?;

        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {e}");
            }
        });

        Ok(Self {
            addr,
            registry,
            metrics,
            shutdown,
            handle,
        })
    }

    /// WebSocket URL of the relay endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Close every connection with going-away, as on SIGTERM.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Poll the registry until `room_count` rooms are live.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Timeout` if the count is not reached within 5s.
    pub async fn wait_for_room_count(&self, room_count: usize) -> Result<(), HarnessError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(status) = self.registry.status().await {
                if status.room_count == room_count {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!("{room_count} rooms")));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.cancel();
        self.handle.abort();
    }
}
