//! `ConnectionActor` - per-WebSocket outbound writer.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one WebSocket
//! - Drains a bounded mailbox of pre-serialized frames into the socket
//! - Writes the close frame when the connection is shut down by the relay
//!
//! Room actors never await a connection: they enqueue with
//! [`ConnectionActorHandle::try_send_frame`], and a full or closed mailbox
//! drops that frame for this connection only.
//!
//! # Lifecycle
//!
//! 1. Spawned by the transport when the WebSocket upgrade completes
//! 2. Runs until a `Close` message, a socket write error, cancellation, or
//!    every handle is dropped
//! 3. The inbound half owns the handle and cancels the actor during cleanup

use crate::errors::RelayError;
use crate::protocol::{CloseReason, Frame, ServerMessage};

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use axum::extract::ws::{CloseFrame, Message};
use common::types::ConnectionId;
use futures::{Sink, SinkExt};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Outbound mailbox is at capacity.
    #[error("outbound mailbox full")]
    Full,

    /// Connection actor has stopped.
    #[error("connection closed")]
    Closed,

    /// Message could not be serialized.
    #[error("frame encoding failed")]
    Encode,
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// `DeliveryError::Full` if the mailbox is at capacity (the drop is
    /// recorded), `DeliveryError::Closed` if the actor has stopped.
    pub fn try_send_frame(&self, frame: Frame) -> Result<(), DeliveryError> {
        match self.sender.try_send(ConnectionMessage::Send { frame }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Serialize and queue a single message.
    ///
    /// # Errors
    ///
    /// See [`ConnectionActorHandle::try_send_frame`]; `DeliveryError::Encode`
    /// if serialization fails.
    pub fn send_message(&self, message: &ServerMessage) -> Result<(), DeliveryError> {
        let frame = message.to_frame().map_err(|e| {
            warn!(
                target: "relay.actor.connection",
                connection_id = %self.connection_id,
                message_type = message.message_type(),
                error = %e,
                "Failed to encode server message"
            );
            DeliveryError::Encode
        })?;
        self.try_send_frame(frame)
    }

    /// Write a close frame after any frames already queued, then stop.
    ///
    /// Waits for mailbox space, so callers should bound this with a timeout.
    pub async fn close(&self, reason: CloseReason) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Close {
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the connection actor. Queued frames are discarded.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S> {
    /// Connection ID.
    connection_id: ConnectionId,
    /// Message receiver.
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// WebSocket write half.
    sink: S,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor, shared with handles for drop accounting.
    mailbox: Arc<MailboxMonitor>,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    /// Spawn a new connection actor writing into `sink`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        sink: S,
        buffer: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        metrics.connection_opened();

        let actor = Self {
            connection_id,
            receiver,
            sink,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "relay.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    let _ = self.sink.close().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "relay.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            let _ = self.sink.close().await;
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.connection_closed();

        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            frames_written = self.mailbox.messages_processed(),
            frames_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { frame } => {
                if let Err(e) = self.sink.send(Message::Text(frame.to_string())).await {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        error = %e,
                        "Socket write failed"
                    );
                    return true;
                }
                false
            }

            ConnectionMessage::Close { reason, respond_to } => {
                self.write_close(reason).await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    /// Write the close frame and close the sink.
    async fn write_close(&mut self, reason: CloseReason) {
        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            code = reason.code(),
            reason = reason.as_str(),
            "Closing connection"
        );

        let frame = CloseFrame {
            code: reason.code(),
            reason: Cow::Borrowed(reason.as_str()),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(
                target: "relay.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Close frame write failed"
            );
        }
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use futures::StreamExt;

    fn spawn_actor(
        buffer: usize,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        UnboundedReceiver<Message>,
        Arc<ActorMetrics>,
    ) {
        let (sink, socket): (UnboundedSender<Message>, _) = unbounded();
        let metrics = ActorMetrics::new();
        let (handle, task) = ConnectionActor::spawn(
            ConnectionId::new(),
            sink,
            buffer,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, task, socket, metrics)
    }

    #[tokio::test]
    async fn test_frames_are_written_in_order() {
        let (handle, _task, mut socket, _metrics) = spawn_actor(8);

        handle.try_send_frame(Frame::from("first")).unwrap();
        handle
            .send_message(&ServerMessage::error("second"))
            .unwrap();

        let Some(Message::Text(first)) = socket.next().await else {
            panic!("expected text frame");
        };
        assert_eq!(first, "first");

        let Some(Message::Text(second)) = socket.next().await else {
            panic!("expected text frame");
        };
        assert_eq!(second, r#"{"type":"error","message":"second"}"#);
    }

    #[tokio::test]
    async fn test_close_writes_close_frame_and_stops() {
        let (handle, task, mut socket, metrics) = spawn_actor(8);
        assert_eq!(metrics.connection_count(), 1);

        handle.try_send_frame(Frame::from("bye")).unwrap();
        handle.close(CloseReason::RateLimited).await.unwrap();
        task.await.unwrap();

        assert!(matches!(socket.next().await, Some(Message::Text(_))));
        let Some(Message::Close(Some(frame))) = socket.next().await else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 4002);
        assert_eq!(frame.reason, "rate_limited");
        assert!(socket.next().await.is_none());

        assert_eq!(metrics.connection_count(), 0);
        assert_eq!(
            handle.try_send_frame(Frame::from("late")),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_frame() {
        let (handle, _task, _socket, _metrics) = spawn_actor(1);

        // The actor task cannot run until this task yields.
        handle.try_send_frame(Frame::from("one")).unwrap();
        assert_eq!(
            handle.try_send_frame(Frame::from("two")),
            Err(DeliveryError::Full)
        );
        assert_eq!(handle.mailbox.messages_dropped(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_close_frame() {
        let (handle, task, mut socket, _metrics) = spawn_actor(8);

        handle.cancel();
        assert!(handle.is_cancelled());
        task.await.unwrap();

        assert!(socket.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_actor() {
        let (handle, task, mut socket, metrics) = spawn_actor(8);

        drop(handle);
        task.await.unwrap();

        assert!(socket.next().await.is_none());
        assert_eq!(metrics.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_after_stop_is_an_error() {
        let (handle, task, _socket, _metrics) = spawn_actor(8);

        handle.cancel();
        task.await.unwrap();

        assert!(matches!(
            handle.close(CloseReason::Normal).await,
            Err(RelayError::Internal(_))
        ));
    }
}
