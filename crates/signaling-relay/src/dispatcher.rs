//! Inbound message dispatch.
//!
//! The dispatcher turns one accepted text frame into an [`Outcome`] for the
//! connection loop. It never touches the socket itself: replies go back to
//! the loop, room traffic goes through the room actors.
//!
//! # Authorization
//!
//! Only `join` is processed before the session is bound. Every other message
//! is checked twice: against the session binding here, and against the
//! room's current membership (`user_id` AND `connection_id`) inside the room
//! actor, so a half-closed connection can never act for a newer one.
//!
//! # Joins
//!
//! Credential verification runs in a spawned task ([`PendingJoin`]) so the
//! connection loop keeps enforcing the auth deadline and reading frames
//! while it waits. If the connection closes first, the task runs to
//! completion and its result is dropped.

use crate::actors::{ConnectionActorHandle, JoiningMember, MemberProfile, RoomRegistryHandle};
use crate::auth::{AuthError, AuthVerifier, VerifiedIdentity};
use crate::errors::RelayError;
use crate::observability::metrics::{record_join, record_message};
use crate::protocol::{ClientMessage, CloseReason, JoinRequest, ServerMessage};
use crate::session::{Binding, Closing, Session};

use common::types::RoomId;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// What the connection loop does after a frame.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing further.
    Handled,
    /// Send this message back to the sender.
    Reply(ServerMessage),
    /// Await this credential check, then call [`Dispatcher::complete_join`].
    Authenticate(PendingJoin),
    /// Close the connection.
    Close(CloseReason),
}

impl Outcome {
    fn error(err: &RelayError) -> Self {
        Outcome::Reply(ServerMessage::error(err.client_message()))
    }
}

/// A join whose credential is being verified.
#[derive(Debug)]
pub struct PendingJoin {
    room_id: RoomId,
    profile: MemberProfile,
    verification: JoinHandle<Result<VerifiedIdentity, AuthError>>,
}

impl PendingJoin {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Wait for the verification task. Cancel-safe; must not be polled
    /// again after it returns.
    pub async fn verified(&mut self) -> Result<VerifiedIdentity, AuthError> {
        match (&mut self.verification).await {
            Ok(result) => result,
            Err(e) => Err(AuthError::Unavailable(format!(
                "verification task failed: {e}"
            ))),
        }
    }
}

/// Routes client messages for every connection.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RoomRegistryHandle,
    verifier: Arc<dyn AuthVerifier>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, verifier: Arc<dyn AuthVerifier>) -> Self {
        Self { registry, verifier }
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    /// Handle one admitted text frame.
    #[instrument(
        skip_all,
        name = "relay.dispatcher.handle_text",
        fields(connection_id = %session.connection_id())
    )]
    pub async fn handle_text(&self, session: &mut Session, text: &str) -> Outcome {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                let err = RelayError::from(e);
                debug!(
                    target: "relay.dispatcher",
                    connection_id = %session.connection_id(),
                    error = %err,
                    "Rejected client frame"
                );
                return Outcome::error(&err);
            }
        };

        record_message(message.message_type());

        match message {
            ClientMessage::Join(request) => self.begin_join(session, request),
            ClientMessage::Leave => self.leave(session).await,
            ClientMessage::Signal(signal) => {
                let Some(binding) = session.binding() else {
                    return Outcome::error(&RelayError::NotJoined);
                };
                match binding
                    .room
                    .forward(binding.user_id.clone(), session.connection_id(), signal)
                    .await
                {
                    Ok(()) => Outcome::Handled,
                    Err(e) => Outcome::error(&e),
                }
            }
            ClientMessage::UpdateVoiceStatus(updates) => {
                let Some(binding) = session.binding() else {
                    return Outcome::error(&RelayError::NotJoined);
                };
                match binding
                    .room
                    .update_voice_status(binding.user_id.clone(), session.connection_id(), updates)
                    .await
                {
                    Ok(()) => Outcome::Handled,
                    Err(e) => Outcome::error(&e),
                }
            }
        }
    }

    fn begin_join(&self, session: &mut Session, request: JoinRequest) -> Outcome {
        let Ok(room_id) = RoomId::parse(request.room_id) else {
            return Outcome::error(&RelayError::InvalidRoomId);
        };

        if let Err(e) = session.begin_join() {
            return Outcome::error(&e);
        }

        let verifier = Arc::clone(&self.verifier);
        let credential = request.credential;
        let verification = tokio::spawn(async move { verifier.verify(&credential).await });

        debug!(
            target: "relay.dispatcher",
            connection_id = %session.connection_id(),
            room_id = %room_id,
            "Verifying join credential"
        );

        Outcome::Authenticate(PendingJoin {
            room_id,
            profile: MemberProfile {
                name: request.name,
                profile_image_url: request.profile_image_url,
            },
            verification,
        })
    }

    /// Finish a join once its credential check has resolved.
    #[instrument(
        skip_all,
        name = "relay.dispatcher.complete_join",
        fields(connection_id = %session.connection_id(), room_id = %pending.room_id)
    )]
    pub async fn complete_join(
        &self,
        session: &mut Session,
        connection: &ConnectionActorHandle,
        pending: PendingJoin,
        verified: Result<VerifiedIdentity, AuthError>,
    ) -> Outcome {
        let identity = match verified {
            Ok(identity) => identity,
            Err(e) => {
                session.abort_join();
                record_join(RelayError::AuthenticationFailed.as_label());
                warn!(
                    target: "relay.dispatcher",
                    connection_id = %session.connection_id(),
                    error = %e,
                    "Join credential rejected"
                );
                return Outcome::Close(CloseReason::AuthFailed);
            }
        };

        let PendingJoin {
            room_id, profile, ..
        } = pending;
        let member = JoiningMember {
            user_id: identity.user_id.clone(),
            connection_id: session.connection_id(),
            connection: connection.clone(),
            profile,
        };

        let (room, outcome) = match self.registry.join(room_id.clone(), member).await {
            Ok(joined) => joined,
            Err(e) => {
                session.abort_join();
                record_join(e.as_label());
                debug!(
                    target: "relay.dispatcher",
                    connection_id = %session.connection_id(),
                    room_id = %room_id,
                    error = %e,
                    "Join rejected"
                );
                return Outcome::error(&e);
            }
        };

        let binding = Binding {
            room_id: room_id.clone(),
            user_id: identity.user_id,
            room,
        };
        if let Err((e, binding)) = session.bind(binding) {
            warn!(
                target: "relay.dispatcher",
                connection_id = %session.connection_id(),
                error = %e,
                "Session changed state during join, undoing membership"
            );
            binding
                .room
                .leave(binding.user_id, session.connection_id())
                .await;
            return Outcome::error(&e);
        }

        record_join("success");
        info!(
            target: "relay.dispatcher",
            connection_id = %session.connection_id(),
            room_id = %room_id,
            member_count = outcome.member_count,
            "Connection joined room"
        );
        Outcome::Handled
    }

    /// Explicit `leave`: drop membership, then close normally.
    async fn leave(&self, session: &mut Session) -> Outcome {
        if session.binding().is_none() {
            return Outcome::error(&RelayError::NotJoined);
        }
        self.disconnect(session).await;
        Outcome::Close(CloseReason::Normal)
    }

    /// Connection cleanup. Runs the room leave at most once per session;
    /// later calls are no-ops.
    pub async fn disconnect(&self, session: &mut Session) {
        let connection_id = session.connection_id();
        match session.close() {
            Closing::Leave(binding) => {
                let outcome = binding.room.leave(binding.user_id.clone(), connection_id).await;
                debug!(
                    target: "relay.dispatcher",
                    connection_id = %connection_id,
                    room_id = %binding.room_id,
                    removed = outcome.removed,
                    room_closed = outcome.room_closed,
                    "Connection left room"
                );
            }
            Closing::NotJoined | Closing::AlreadyClosed => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, ConnectionActor, RoomSettings};
    use crate::session::RateLimitConfig;
    use crate::store::DisabledStore;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use common::secret::{ExposeSecret, SecretString};
    use common::types::{ConnectionId, UserId};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};
    use futures::StreamExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Accepts `user:<id>` credentials.
    struct PrefixVerifier;

    #[async_trait]
    impl AuthVerifier for PrefixVerifier {
        async fn verify(&self, credential: &SecretString) -> Result<VerifiedIdentity, AuthError> {
            credential
                .expose_secret()
                .strip_prefix("user:")
                .and_then(|id| UserId::parse(id).ok())
                .map(|user_id| VerifiedIdentity { user_id })
                .ok_or(AuthError::InvalidCredential)
        }
    }

    struct Conn {
        session: Session,
        handle: ConnectionActorHandle,
        socket: UnboundedReceiver<Message>,
    }

    impl Conn {
        fn new(metrics: &Arc<ActorMetrics>) -> Self {
            let (sink, socket) = unbounded();
            let connection_id = ConnectionId::new();
            let (handle, _task) = ConnectionActor::spawn(
                connection_id,
                sink,
                16,
                CancellationToken::new(),
                Arc::clone(metrics),
            );
            let session = Session::new(
                connection_id,
                Duration::from_secs(10),
                RateLimitConfig {
                    window: Duration::from_secs(10),
                    max_messages: 120,
                },
                65536,
            );
            Self {
                session,
                handle,
                socket,
            }
        }

        async fn next_json(&mut self) -> Value {
            let Some(Message::Text(text)) = self.socket.next().await else {
                panic!("expected text frame");
            };
            serde_json::from_str(&text).unwrap()
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<ActorMetrics>) {
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            RoomSettings {
                capacity: 8,
                store_timeout: Duration::from_secs(1),
            },
            Arc::new(DisabledStore),
            Arc::clone(&metrics),
        );
        (Dispatcher::new(registry, Arc::new(PrefixVerifier)), metrics)
    }

    async fn join(dispatcher: &Dispatcher, conn: &mut Conn, room: &str, user: &str) -> Outcome {
        let frame = format!(r#"{{"type":"join","roomId":"{room}","credential":"user:{user}"}}"#);
        match dispatcher.handle_text(&mut conn.session, &frame).await {
            Outcome::Authenticate(mut pending) => {
                let verified = pending.verified().await;
                dispatcher
                    .complete_join(&mut conn.session, &conn.handle, pending, verified)
                    .await
            }
            other => other,
        }
    }

    fn error_message(outcome: Outcome) -> String {
        let Outcome::Reply(ServerMessage::Error { message }) = outcome else {
            panic!("expected error reply, got {outcome:?}");
        };
        message
    }

    #[tokio::test]
    async fn test_join_binds_session() {
        let (dispatcher, metrics) = dispatcher();
        let mut alice = Conn::new(&metrics);

        let outcome = join(&dispatcher, &mut alice, "R1", "alice").await;
        assert!(matches!(outcome, Outcome::Handled));

        let binding = alice.session.binding().unwrap();
        assert_eq!(binding.user_id.as_str(), "alice");
        assert_eq!(binding.room_id.as_str(), "R1");
        assert_eq!(alice.next_json().await["type"], "roomJoined");
    }

    #[tokio::test]
    async fn test_messages_before_join_are_rejected() {
        let (dispatcher, metrics) = dispatcher();
        let mut conn = Conn::new(&metrics);

        for frame in [
            r#"{"type":"offer","targetUserId":"bob","sdp":"x"}"#,
            r#"{"type":"updateVoiceStatus","updates":{"isMicActive":false}}"#,
            r#"{"type":"leave"}"#,
        ] {
            let outcome = dispatcher.handle_text(&mut conn.session, frame).await;
            assert_eq!(error_message(outcome), "Not authorized: Join a room first");
        }
        assert!(!conn.session.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_room_id_rejected_without_state_change() {
        let (dispatcher, metrics) = dispatcher();
        let mut conn = Conn::new(&metrics);

        let outcome = dispatcher
            .handle_text(
                &mut conn.session,
                r#"{"type":"join","roomId":"bad room!","credential":"user:alice"}"#,
            )
            .await;
        assert_eq!(error_message(outcome), "Invalid roomId");

        // Still able to join
        let outcome = join(&dispatcher, &mut conn, "R1", "alice").await;
        assert!(matches!(outcome, Outcome::Handled));
    }

    #[tokio::test]
    async fn test_bad_credential_closes_with_auth_failure() {
        let (dispatcher, metrics) = dispatcher();
        let mut conn = Conn::new(&metrics);

        let outcome = dispatcher
            .handle_text(
                &mut conn.session,
                r#"{"type":"join","roomId":"R1","credential":"nope"}"#,
            )
            .await;
        let Outcome::Authenticate(mut pending) = outcome else {
            panic!("expected pending join");
        };
        let verified = pending.verified().await;
        let outcome = dispatcher
            .complete_join(&mut conn.session, &conn.handle, pending, verified)
            .await;

        assert!(matches!(outcome, Outcome::Close(CloseReason::AuthFailed)));
        assert!(conn.session.binding().is_none());
        assert_eq!(
            dispatcher.registry().status().await.unwrap().room_count,
            0
        );
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let (dispatcher, metrics) = dispatcher();
        let mut conn = Conn::new(&metrics);
        join(&dispatcher, &mut conn, "R1", "alice").await;

        let outcome = join(&dispatcher, &mut conn, "R2", "alice").await;
        assert_eq!(error_message(outcome), "Already joined a room");
        assert_eq!(conn.session.binding().unwrap().room_id.as_str(), "R1");
    }

    #[tokio::test]
    async fn test_unknown_type_answered_with_error() {
        let (dispatcher, metrics) = dispatcher();
        let mut conn = Conn::new(&metrics);

        let outcome = dispatcher
            .handle_text(&mut conn.session, r#"{"type":"kick","userId":"bob"}"#)
            .await;
        assert_eq!(error_message(outcome), "Unknown message type");
    }

    #[tokio::test]
    async fn test_malformed_json_answered_with_error() {
        let (dispatcher, metrics) = dispatcher();
        let mut conn = Conn::new(&metrics);

        let outcome = dispatcher.handle_text(&mut conn.session, "{not json").await;
        assert!(error_message(outcome).starts_with("Invalid message"));
    }

    #[tokio::test]
    async fn test_offer_forwarded_with_sender_stamped() {
        let (dispatcher, metrics) = dispatcher();
        let mut alice = Conn::new(&metrics);
        let mut bob = Conn::new(&metrics);
        join(&dispatcher, &mut alice, "R1", "alice").await;
        join(&dispatcher, &mut bob, "R1", "bob").await;
        let _ = bob.next_json().await;

        let outcome = dispatcher
            .handle_text(
                &mut alice.session,
                r#"{"type":"offer","roomId":"R9","targetUserId":"bob","fromUserId":"eve","sdp":"v=0..."}"#,
            )
            .await;
        assert!(matches!(outcome, Outcome::Handled));

        let offer = bob.next_json().await;
        assert_eq!(offer["fromUserId"], "alice");
        assert_eq!(offer["sdp"], "v=0...");
        assert!(offer.get("roomId").is_none());
    }

    #[tokio::test]
    async fn test_candidate_to_absent_peer() {
        let (dispatcher, metrics) = dispatcher();
        let mut alice = Conn::new(&metrics);
        join(&dispatcher, &mut alice, "R1", "alice").await;

        let outcome = dispatcher
            .handle_text(
                &mut alice.session,
                r#"{"type":"candidate","targetUserId":"ghost","candidate":{}}"#,
            )
            .await;
        assert_eq!(error_message(outcome), "Peer is unreachable");
    }

    #[tokio::test]
    async fn test_leave_closes_normally_and_is_idempotent() {
        let (dispatcher, metrics) = dispatcher();
        let mut alice = Conn::new(&metrics);
        join(&dispatcher, &mut alice, "R1", "alice").await;

        let outcome = dispatcher
            .handle_text(&mut alice.session, r#"{"type":"leave"}"#)
            .await;
        assert!(matches!(outcome, Outcome::Close(CloseReason::Normal)));
        assert!(alice.session.is_closed());

        // Transport cleanup after leave is a no-op
        dispatcher.disconnect(&mut alice.session).await;
        assert_eq!(
            dispatcher.registry().status().await.unwrap().room_count,
            0
        );
    }

    #[tokio::test]
    async fn test_room_full_reply() {
        let (dispatcher, metrics) = dispatcher();
        let mut members = Vec::new();
        for i in 0..8 {
            let mut conn = Conn::new(&metrics);
            let outcome = join(&dispatcher, &mut conn, "R1", &format!("user-{i}")).await;
            assert!(matches!(outcome, Outcome::Handled));
            members.push(conn);
        }

        let mut ninth = Conn::new(&metrics);
        let outcome = join(&dispatcher, &mut ninth, "R1", "user-9").await;
        assert_eq!(error_message(outcome), "Room is full");
        assert!(ninth.session.binding().is_none());

        let state = dispatcher
            .registry()
            .room_state(RoomId::parse("R1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.members.len(), 8);
    }
}
