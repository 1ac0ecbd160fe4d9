//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] wrappers used for join credentials and the
//! store URL. `SecretString` redacts itself in `Debug`, so structs holding
//! one can derive `Debug` and still be traced safely.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct JoinAttempt {
//!     room_id: String,
//!     credential: SecretString,
//! }
//!
//! let attempt = JoinAttempt {
//!     room_id: "lobby".to_string(),
//!     credential: SecretString::from("eyJhbGciOi..."),
//! };
//!
//! assert!(!format!("{attempt:?}").contains("eyJhbGciOi"));
//! assert_eq!(attempt.credential.expose_secret(), "eyJhbGciOi...");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("bearer-token");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("bearer-token"));
    }

    #[test]
    fn test_deserialized_credential_is_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct JoinFrame {
            #[serde(rename = "roomId")]
            room_id: String,
            credential: SecretString,
        }

        let json = r#"{"roomId": "lobby", "credential": "signed.jwt.value"}"#;
        let frame: JoinFrame = serde_json::from_str(json).expect("deserialize");

        assert_eq!(frame.credential.expose_secret(), "signed.jwt.value");

        let debug = format!("{frame:?}");
        assert!(debug.contains("lobby"));
        assert!(!debug.contains("signed.jwt.value"));
    }

    #[test]
    fn test_clone_preserves_value() {
        let secret = SecretString::from("cloneable");
        let cloned = secret.clone();
        assert_eq!(cloned.expose_secret(), "cloneable");
    }
}
