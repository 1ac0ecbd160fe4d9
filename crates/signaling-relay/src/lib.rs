//! Signaling Relay Library
//!
//! A WebSocket relay that lets clients in the same room find each other and
//! exchange the messages needed to set up direct peer-to-peer media sessions:
//!
//! - Authenticated room membership (one identity per connection, bound once)
//! - Targeted forwarding of `offer` / `answer` / `candidate` payloads
//! - Voice presence (`isMicActive`, `isSpeaking`) broadcast to the room
//! - Best-effort mirroring of room membership into Redis
//!
//! Media never flows through the relay.
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per non-empty room, single writer of its members)
//!         └── holds handles to ConnectionActors
//!             └── ConnectionActor (one per WebSocket, owns the write half)
//!
//! per-connection inbound task
//! ├── owns the Session (auth state, binding, rate limit)
//! └── Dispatcher (parse, authorize, route to the RoomActor)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`auth`] - Credential verification (`AuthVerifier`)
//! - [`config`] - Service configuration from environment
//! - [`dispatcher`] - Message routing for authenticated sessions
//! - [`errors`] - Error types with client-safe messages
//! - [`protocol`] - JSON wire format and close codes
//! - [`session`] - Per-connection state machine and rate limiting
//! - [`store`] - Participant mirror (`ParticipantStore`)
//! - [`transport`] - axum WebSocket endpoint

pub mod actors;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
