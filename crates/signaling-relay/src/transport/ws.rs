//! WebSocket endpoint (`GET /ws`).
//!
//! Each upgraded socket is split in two:
//!
//! - the write half goes to a [`ConnectionActor`], which rooms feed through
//!   its bounded mailbox
//! - the read half stays in [`handle_socket`], which owns the [`Session`]
//!   and drives the [`Dispatcher`]
//!
//! The read loop also enforces the auth deadline, the rate limit, the size
//! ceiling and server shutdown. Whatever ends the loop, cleanup runs once:
//! leave the room (if joined), write the close frame (if the relay is the
//! one closing), stop the writer.

use crate::actors::{ActorMetrics, ConnectionActor, ConnectionActorHandle};
use crate::auth::{AuthError, VerifiedIdentity};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Outcome, PendingJoin};
use crate::observability::metrics::record_connection_closed;
use crate::protocol::CloseReason;
use crate::session::{RateLimitConfig, Session};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Frames up to this multiple of the ceiling are read and rejected with a
/// close code; anything larger is cut off by the WebSocket codec.
const CODEC_LIMIT_FACTOR: usize = 4;

/// Bound on writing the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for the writer to stop after cleanup.
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Metrics label for connections the client closed.
const PEER_CLOSED: &str = "peer_closed";

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub auth_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub max_message_bytes: usize,
    pub outbound_buffer: usize,
}

impl ConnectionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth_timeout: config.auth_timeout,
            rate_limit: RateLimitConfig {
                window: config.rate_limit_window,
                max_messages: config.rate_limit_max_messages,
            },
            max_message_bytes: config.max_message_bytes,
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// Shared state for the WebSocket endpoint.
#[derive(Clone)]
pub struct RelayState {
    pub dispatcher: Dispatcher,
    pub metrics: Arc<ActorMetrics>,
    pub settings: ConnectionSettings,
    /// Cancelled at shutdown; every connection closes with going-away.
    pub shutdown: CancellationToken,
}

/// Build the WebSocket router.
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let codec_limit = state
        .settings
        .max_message_bytes
        .saturating_mul(CODEC_LIMIT_FACTOR);

    ws.max_message_size(codec_limit)
        .max_frame_size(codec_limit)
        .on_upgrade(move |socket| handle_socket(socket, remote, state))
}

/// Something that woke the read loop.
enum Event {
    Shutdown,
    AuthDeadline,
    Verified(Result<VerifiedIdentity, AuthError>),
    Frame(Option<Result<Message, axum::Error>>),
}

#[instrument(skip_all, name = "relay.ws.connection", fields(remote = %remote))]
async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: RelayState) {
    let connection_id = ConnectionId::new();
    let settings = state.settings;
    let (sink, mut stream) = socket.split();

    let (connection, writer) = ConnectionActor::spawn(
        connection_id,
        sink,
        settings.outbound_buffer,
        state.dispatcher.registry().child_token(),
        Arc::clone(&state.metrics),
    );

    info!(
        target: "relay.ws",
        connection_id = %connection_id,
        remote = %remote,
        "Connection opened"
    );

    let mut session = Session::new(
        connection_id,
        settings.auth_timeout,
        settings.rate_limit,
        settings.max_message_bytes,
    );
    let mut pending: Option<PendingJoin> = None;

    let close_reason = loop {
        let event = tokio::select! {
            () = state.shutdown.cancelled() => Event::Shutdown,
            () = wait_deadline(session.auth_deadline()) => Event::AuthDeadline,
            verified = wait_verified(&mut pending) => Event::Verified(verified),
            frame = stream.next() => Event::Frame(frame),
        };

        let outcome = match event {
            Event::Shutdown => break Some(CloseReason::GoingAway),
            Event::AuthDeadline => {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    "Auth deadline passed"
                );
                break Some(CloseReason::AuthTimeout);
            }
            Event::Verified(verified) => {
                let Some(join) = pending.take() else {
                    continue;
                };
                state
                    .dispatcher
                    .complete_join(&mut session, &connection, join, verified)
                    .await
            }
            Event::Frame(None) | Event::Frame(Some(Ok(Message::Close(_)))) => break None,
            Event::Frame(Some(Err(e))) => {
                if is_frame_size_violation(&e) {
                    break Some(CloseReason::MessageTooLarge);
                }
                debug!(
                    target: "relay.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket read failed"
                );
                break None;
            }
            Event::Frame(Some(Ok(Message::Binary(_)))) => {
                break Some(session.admit_binary(Instant::now()));
            }
            Event::Frame(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Event::Frame(Some(Ok(Message::Text(text)))) => {
                if let Err(reason) = session.admit_text(text.len(), Instant::now()) {
                    break Some(reason);
                }
                state.dispatcher.handle_text(&mut session, &text).await
            }
        };

        match outcome {
            Outcome::Handled => {}
            Outcome::Reply(message) => {
                if let Err(e) = connection.send_message(&message) {
                    debug!(
                        target: "relay.ws",
                        connection_id = %connection_id,
                        error = %e,
                        "Reply dropped"
                    );
                }
            }
            Outcome::Authenticate(join) => pending = Some(join),
            Outcome::Close(reason) => break Some(reason),
        }
    };

    // A verification still in flight runs to completion; its result is dropped
    drop(pending);

    cleanup(&state, &mut session, &connection, writer, close_reason).await;

    info!(
        target: "relay.ws",
        connection_id = %connection_id,
        remote = %remote,
        reason = close_reason.map_or(PEER_CLOSED, |r| r.as_str()),
        "Connection closed"
    );
}

async fn cleanup(
    state: &RelayState,
    session: &mut Session,
    connection: &ConnectionActorHandle,
    writer: tokio::task::JoinHandle<()>,
    close_reason: Option<CloseReason>,
) {
    state.dispatcher.disconnect(session).await;

    if let Some(reason) = close_reason {
        match tokio::time::timeout(CLOSE_TIMEOUT, connection.close(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "Writer already stopped"
                );
            }
            Err(_) => {
                debug!(
                    target: "relay.ws",
                    connection_id = %connection.connection_id(),
                    "Close frame write timed out"
                );
            }
        }
    }

    connection.cancel();
    if tokio::time::timeout(WRITER_STOP_TIMEOUT, writer).await.is_err() {
        debug!(
            target: "relay.ws",
            connection_id = %connection.connection_id(),
            "Writer did not stop in time"
        );
    }

    record_connection_closed(close_reason.map_or(PEER_CLOSED, |r| r.as_str()));
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_verified(pending: &mut Option<PendingJoin>) -> Result<VerifiedIdentity, AuthError> {
    match pending {
        Some(join) => join.verified().await,
        None => std::future::pending().await,
    }
}

/// The codec reports oversized messages only through its error text.
fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_settings_from_config() {
        let vars = HashMap::from([(
            "RELAY_JWT_PUBLIC_KEY".to_string(),
            "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo".to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();
        let settings = ConnectionSettings::from_config(&config);

        assert_eq!(settings.auth_timeout, Duration::from_secs(10));
        assert_eq!(settings.rate_limit.max_messages, 120);
        assert_eq!(settings.rate_limit.window, Duration::from_secs(10));
        assert_eq!(settings.max_message_bytes, 65536);
        assert_eq!(settings.outbound_buffer, 256);
    }

    #[test]
    fn test_frame_size_violation_detection() {
        let oversized = axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "Space limit exceeded: Message too long: 300000 > 262144",
        ));
        assert!(is_frame_size_violation(&oversized));

        let reset = axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(!is_frame_size_violation(&reset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline_fires_at_deadline() {
        let start = Instant::now();
        wait_deadline(Some(start + Duration::from_secs(10))).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline_without_deadline_never_fires() {
        let result =
            tokio::time::timeout(Duration::from_secs(3600), wait_deadline(None)).await;
        assert!(result.is_err());
    }
}
