//! Actor model implementation for the signaling relay.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! ├── supervises N RoomActors
//! │   └── RoomActor (one per non-empty room)
//! │       ├── owns the member map and presence
//! │       ├── queues store writes to its MirrorWriter
//! │       └── holds a ConnectionActorHandle per member
//! └── root CancellationToken
//!     └── ConnectionActor (one per WebSocket, child token)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per room**: every membership change runs inside the
//!   room's actor, so capacity checks never see a stale snapshot
//! - **Non-blocking fan-out**: rooms `try_send` into bounded connection
//!   mailboxes; a slow client only loses its own frames
//! - **Epoch-tagged rooms**: the registry never confuses a closing room
//!   with its successor
//! - **CancellationToken propagation**: the registry's root token cancels
//!   rooms and connections on shutdown
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` directory of live rooms
//! - [`room`] - `RoomActor` per room
//! - [`connection`] - `ConnectionActor` per WebSocket
//! - [`mirror`] - `MirrorWriter` per room, ordered store writes
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod mirror;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle, DeliveryError};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use mirror::{MirrorHandle, MirrorWriter};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomSettings};
