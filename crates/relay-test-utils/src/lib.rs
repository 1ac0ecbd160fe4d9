//! # Relay Test Utilities
//!
//! Shared test utilities for the signaling relay.
//!
//! This crate provides mock implementations and test fixtures for
//! isolated relay testing without requiring real infrastructure.
//!
//! ## Modules
//!
//! - `mock_auth` - Scriptable `AuthVerifier` (`user:<id>` credentials)
//! - `mock_store` - In-memory `ParticipantStore` with call log and failure injection
//! - `fixtures` - Deterministic Ed25519 keys and JWT builders
//! - `server_harness` - Real relay server on a random port
//! - `ws_client` - WebSocket test client speaking the relay's JSON protocol
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = MockParticipantStore::new();
//!     let server = TestRelayServer::spawn(
//!         TestRelayOptions::default().with_store(store.clone()),
//!     )
//!     .await
//!     .unwrap();
//!
//!     let mut alice = TestClient::connect(&server.url()).await.unwrap();
//!     alice.join("room-1", "user:alice").await.unwrap();
//!     let joined = alice.recv_type("roomJoined").await.unwrap();
//!
//!     assert_eq!(store.participant_count("room-1"), 1);
//! }
//! ```

pub mod fixtures;
pub mod mock_auth;
pub mod mock_store;
pub mod server_harness;
pub mod ws_client;

pub use fixtures::{TestKeypair, TestTokenBuilder};
pub use mock_auth::MockAuthVerifier;
pub use mock_store::{MockParticipantStore, StoreCall};
pub use server_harness::{HarnessError, TestRelayOptions, TestRelayServer};
pub use ws_client::TestClient;
