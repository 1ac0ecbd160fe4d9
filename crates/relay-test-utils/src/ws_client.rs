//! WebSocket test client.
//!
//! Speaks the relay's JSON text protocol. Every receive is bounded by
//! [`RECV_TIMEOUT`] so a missing frame fails the test instead of hanging it.

use crate::server_harness::HarnessError;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound on waiting for a single frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for relay tests.
pub struct TestClient {
    stream: Stream,
}

impl TestClient {
    /// Connect to `url` (e.g. `TestRelayServer::url()`).
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, HarnessError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| HarnessError::WebSocket(e.to_string()))?;
        Ok(Self { stream })
    }

    /// Send a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the write fails.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), HarnessError> {
        self.stream
            .send(Message::text(text.into()))
            .await
            .map_err(|e| HarnessError::WebSocket(e.to_string()))
    }

    /// Send a JSON value as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the write fails.
    pub async fn send_json(&mut self, value: &Value) -> Result<(), HarnessError> {
        self.send_text(value.to_string()).await
    }

    /// Send a binary frame.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the write fails.
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), HarnessError> {
        self.stream
            .send(Message::binary(data))
            .await
            .map_err(|e| HarnessError::WebSocket(e.to_string()))
    }

    /// Send a `join` for `room_id` with `credential`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the write fails.
    pub async fn join(&mut self, room_id: &str, credential: &str) -> Result<(), HarnessError> {
        self.send_json(&json!({
            "type": "join",
            "roomId": room_id,
            "credential": credential,
        }))
        .await
    }

    /// Join and wait for `roomJoined`, returning it.
    ///
    /// # Errors
    ///
    /// Returns an error if anything other than `roomJoined` arrives first.
    pub async fn join_ok(&mut self, room_id: &str, credential: &str) -> Result<Value, HarnessError> {
        self.join(room_id, credential).await?;
        self.recv_type("roomJoined").await
    }

    /// Send a `leave`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the write fails.
    pub async fn leave(&mut self) -> Result<(), HarnessError> {
        self.send_json(&json!({ "type": "leave" })).await
    }

    /// Next JSON text frame, skipping control frames.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::UnexpectedFrame` on a close or binary frame,
    /// `HarnessError::Timeout` if nothing arrives in time.
    pub async fn recv_json(&mut self) -> Result<Value, HarnessError> {
        loop {
            match self.next_message().await? {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| HarnessError::UnexpectedFrame(format!("not JSON: {e}")));
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => return Err(HarnessError::UnexpectedFrame(format!("{other:?}"))),
            }
        }
    }

    /// Next JSON frame, which must have `type == message_type`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::UnexpectedFrame` if the next frame has another type.
    pub async fn recv_type(&mut self, message_type: &str) -> Result<Value, HarnessError> {
        let value = self.recv_json().await?;
        if value["type"] == message_type {
            Ok(value)
        } else {
            Err(HarnessError::UnexpectedFrame(format!(
                "expected {message_type}, got {value}"
            )))
        }
    }

    /// Skip frames until one with `type == message_type` arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection closes or nothing matches in time.
    pub async fn recv_until(&mut self, message_type: &str) -> Result<Value, HarnessError> {
        loop {
            let value = self.recv_json().await?;
            if value["type"] == message_type {
                return Ok(value);
            }
        }
    }

    /// Read until the close frame, returning its code and reason.
    ///
    /// Text frames before the close are discarded. `None` means the stream
    /// ended without a close frame.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Timeout` if the connection stays open.
    pub async fn recv_close(&mut self) -> Result<Option<(u16, String)>, HarnessError> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| HarnessError::Timeout("close frame".to_string()))?;

            match next {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| (u16::from(f.code), f.reason.to_string())));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }

    /// Assert nothing but control frames arrives for `window`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::UnexpectedFrame` with the first data frame seen.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), HarnessError> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Ok(()),
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                Ok(other) => return Err(HarnessError::UnexpectedFrame(format!("{other:?}"))),
            }
        }
    }

    /// Close the connection from the client side.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::WebSocket` if the close handshake fails.
    pub async fn close(mut self) -> Result<(), HarnessError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| HarnessError::WebSocket(e.to_string()))
    }

    async fn next_message(&mut self) -> Result<Message, HarnessError> {
        match tokio::time::timeout(RECV_TIMEOUT, self.stream.next()).await {
            Err(_) => Err(HarnessError::Timeout("frame".to_string())),
            Ok(None) => Err(HarnessError::UnexpectedFrame("stream ended".to_string())),
            Ok(Some(Err(e))) => Err(HarnessError::WebSocket(e.to_string())),
            Ok(Some(Ok(message))) => Ok(message),
        }
    }
}
