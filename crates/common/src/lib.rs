//! Common utilities and types shared across the signaling relay crates.

#![warn(clippy::pedantic)]

/// Validated room, user and connection identifiers
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, claims, iat validation)
pub mod jwt;
