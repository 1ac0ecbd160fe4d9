//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Connection | < 50   | 50-200  | > 200    |
//!
//! Gauges and counters are mirrored to Prometheus via
//! [`crate::observability::metrics`].

use crate::observability::metrics::{
    record_actor_panic, record_message_dropped, set_actor_mailbox_depth, set_connections_active,
    set_rooms_active,
};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for registry and room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per non-empty room).
    Room,
    /// `ConnectionActor` (one per WebSocket).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks one actor's queue depth from inside its run loop.
///
/// The actor samples its receiver's backlog each time it takes a message
/// ([`MailboxMonitor::observe`]); frames that could not be enqueued are
/// counted on the sending side ([`MailboxMonitor::record_drop`]).
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record the backlog seen when a message was taken, and count it.
    pub fn observe(&self, backlog: usize) {
        let previous = self.depth.swap(backlog, Ordering::Relaxed);
        self.peak_depth.fetch_max(backlog, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);

        match self.level_for_depth(backlog) {
            MailboxLevel::Critical => {
                warn!(
                    target: "relay.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = backlog,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if previous <= self.actor_type.normal_threshold() => {
                // Log once when crossing into the warning band
                debug!(
                    target: "relay.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = backlog,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }

        if previous != backlog {
            set_actor_mailbox_depth(self.actor_type.as_str(), backlog);
        }
    }

    /// Record a message that could not be delivered into this mailbox.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "relay.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated metrics for the actor system.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Rooms with at least one member.
    pub active_rooms: AtomicUsize,
    /// Open WebSocket connections.
    pub active_connections: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Total messages processed across registry and room actors.
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        set_rooms_active(rooms as u64);
    }

    pub fn room_removed(&self) {
        let rooms = self
            .active_rooms
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        set_rooms_active(rooms as u64);
    }

    pub fn connection_opened(&self) {
        let connections = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        set_connections_active(connections as u64);
    }

    pub fn connection_closed(&self) {
        let connections = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        set_connections_active(connections as u64);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "relay.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}
