//! Per-connection session state.
//!
//! ```text
//! Unauthenticated ──join──> Joining ──verified + admitted──> Joined
//!        ^                     │                               │
//!        └──── rejected ───────┘                               │
//!   (any state) ──────────────── close ──────────────────> Closed
//! ```
//!
//! The `(user_id, room_id)` binding is written exactly once, in
//! [`Session::bind`], and only read afterwards. [`Session::close`] is the
//! single exit path: the first call hands back the binding for cleanup and
//! every later call is a no-op.

use crate::actors::RoomActorHandle;
use crate::errors::RelayError;
use crate::protocol::CloseReason;

use common::types::{ConnectionId, RoomId, UserId};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limit settings: at most `max_messages` data frames per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_messages: u32,
}

/// Fixed-window frame counter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            window_start: now,
            count: 0,
        }
    }

    /// Count one frame. Returns `false` once the window's cap is exceeded.
    pub fn allow(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= self.config.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.config.max_messages
    }
}

/// A connection's room membership, fixed for the rest of its lifetime.
#[derive(Debug, Clone)]
pub struct Binding {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub room: RoomActorHandle,
}

#[derive(Debug)]
enum SessionState {
    Unauthenticated { deadline: Instant },
    Joining { deadline: Instant },
    Joined(Binding),
    Closed,
}

/// Result of [`Session::close`].
#[derive(Debug)]
pub enum Closing {
    /// Session was already closed; nothing to clean up.
    AlreadyClosed,
    /// Session never joined a room.
    NotJoined,
    /// Session was a room member; the binding must be removed from the room.
    Leave(Binding),
}

/// Per-connection state owned by the connection's inbound task.
#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    state: SessionState,
    rate_limiter: RateLimiter,
    max_message_bytes: usize,
}

impl Session {
    /// New unauthenticated session whose auth deadline starts now.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        auth_timeout: Duration,
        rate_limit: RateLimitConfig,
        max_message_bytes: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            state: SessionState::Unauthenticated {
                deadline: now + auth_timeout,
            },
            rate_limiter: RateLimiter::new(rate_limit, now),
            max_message_bytes,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Deadline for a successful join; `None` once joined or closed.
    #[must_use]
    pub fn auth_deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::Unauthenticated { deadline } | SessionState::Joining { deadline } => {
                Some(deadline)
            }
            SessionState::Joined(_) | SessionState::Closed => None,
        }
    }

    #[must_use]
    pub fn binding(&self) -> Option<&Binding> {
        match &self.state {
            SessionState::Joined(binding) => Some(binding),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// Admit a text frame of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns the close reason if the frame exceeds the rate limit or the
    /// size ceiling.
    pub fn admit_text(&mut self, len: usize, now: Instant) -> Result<(), CloseReason> {
        if !self.rate_limiter.allow(now) {
            return Err(CloseReason::RateLimited);
        }
        if len > self.max_message_bytes {
            return Err(CloseReason::MessageTooLarge);
        }
        Ok(())
    }

    /// Binary frames are never processed; they still count toward the rate.
    #[must_use]
    pub fn admit_binary(&mut self, now: Instant) -> CloseReason {
        if self.rate_limiter.allow(now) {
            CloseReason::BinaryUnsupported
        } else {
            CloseReason::RateLimited
        }
    }

    /// Move to `Joining` ahead of credential verification.
    ///
    /// # Errors
    ///
    /// `AlreadyJoined` if bound, `JoinInProgress` if a join is pending,
    /// `Internal` if closed.
    pub fn begin_join(&mut self) -> Result<(), RelayError> {
        match self.state {
            SessionState::Unauthenticated { deadline } => {
                self.state = SessionState::Joining { deadline };
                Ok(())
            }
            SessionState::Joining { .. } => Err(RelayError::JoinInProgress),
            SessionState::Joined(_) => Err(RelayError::AlreadyJoined),
            SessionState::Closed => Err(RelayError::Internal("session closed".to_string())),
        }
    }

    /// Return to `Unauthenticated` after a rejected join. The original
    /// deadline still applies.
    pub fn abort_join(&mut self) {
        if let SessionState::Joining { deadline } = self.state {
            self.state = SessionState::Unauthenticated { deadline };
        }
    }

    /// Stamp the binding. Only valid from `Joining`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the session is not in `Joining`; the binding is
    /// handed back so the caller can undo the room membership.
    pub fn bind(&mut self, binding: Binding) -> Result<(), (RelayError, Binding)> {
        match self.state {
            SessionState::Joining { .. } => {
                self.state = SessionState::Joined(binding);
                Ok(())
            }
            _ => Err((
                RelayError::Internal("bind outside of join".to_string()),
                binding,
            )),
        }
    }

    /// Transition to `Closed`. Only the first call returns the binding.
    pub fn close(&mut self) -> Closing {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Closed => Closing::AlreadyClosed,
            SessionState::Joined(binding) => Closing::Leave(binding),
            SessionState::Unauthenticated { .. } | SessionState::Joining { .. } => {
                Closing::NotJoined
            }
        }
    }
}
