//! Client-facing transport.
//!
//! The relay speaks JSON text frames over WebSocket; see [`ws`].

pub mod ws;

pub use ws::{relay_router, ConnectionSettings, RelayState};
