//! Signaling relay configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket listener address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default maximum members per room.
pub const DEFAULT_ROOM_CAPACITY: usize = 8;

/// Default rate limit window in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 10;

/// Default maximum data frames per rate limit window.
pub const DEFAULT_RATE_LIMIT_MAX_MESSAGES: u32 = 120;

/// Default text frame ceiling in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default time allowed between connect and a successful join.
pub const DEFAULT_AUTH_TIMEOUT_SECONDS: u64 = 10;

/// Default timeout for a single participant store write.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Default per-connection outbound mailbox size.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Signaling relay configuration.
#[derive(Clone)]
pub struct Config {
    /// WebSocket listener address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health and metrics endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Redis connection URL for the participant mirror.
    /// `None` disables mirroring. Protected by `SecretString` to prevent
    /// accidental logging.
    pub redis_url: Option<SecretString>,

    /// Ed25519 public key for credential verification (base64url JWK `x`).
    pub jwt_public_key: String,

    /// Tolerance for credential `iat` in the future.
    pub jwt_clock_skew: Duration,

    /// Maximum members per room.
    pub room_capacity: usize,

    /// Rate limit window.
    pub rate_limit_window: Duration,

    /// Maximum data frames per rate limit window.
    pub rate_limit_max_messages: u32,

    /// Text frame ceiling in bytes.
    pub max_message_bytes: usize,

    /// Time allowed between connect and a successful join.
    pub auth_timeout: Duration,

    /// Timeout for a single participant store write.
    pub store_timeout: Duration,

    /// Per-connection outbound mailbox size.
    pub outbound_buffer: usize,

    /// Emit logs as JSON.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("jwt_public_key", &self.jwt_public_key)
            .field("jwt_clock_skew", &self.jwt_clock_skew)
            .field("room_capacity", &self.room_capacity)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("rate_limit_max_messages", &self.rate_limit_max_messages)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("auth_timeout", &self.auth_timeout)
            .field("store_timeout", &self.store_timeout)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional strictly positive integer, falling back to `default`.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: T = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{name} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }

    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// fails validation.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_public_key = vars
            .get("RELAY_JWT_PUBLIC_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("RELAY_JWT_PUBLIC_KEY".to_string()))?
            .trim()
            .to_string();

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|v| !v.trim().is_empty())
            .map(|v| SecretString::from(v.clone()));

        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        // Parse JWT clock skew tolerance with an upper bound
        let clock_skew_seconds = parse_positive(
            vars,
            "RELAY_JWT_CLOCK_SKEW_SECONDS",
            DEFAULT_CLOCK_SKEW.as_secs(),
        )?;
        if clock_skew_seconds > MAX_CLOCK_SKEW.as_secs() {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                MAX_CLOCK_SKEW.as_secs(),
                clock_skew_seconds
            )));
        }

        let room_capacity = parse_positive(vars, "RELAY_ROOM_CAPACITY", DEFAULT_ROOM_CAPACITY)?;

        let rate_limit_window_seconds = parse_positive(
            vars,
            "RELAY_RATE_LIMIT_WINDOW_SECONDS",
            DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
        )?;

        let rate_limit_max_messages = parse_positive(
            vars,
            "RELAY_RATE_LIMIT_MAX_MESSAGES",
            DEFAULT_RATE_LIMIT_MAX_MESSAGES,
        )?;

        let max_message_bytes =
            parse_positive(vars, "RELAY_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?;

        let auth_timeout_seconds = parse_positive(
            vars,
            "RELAY_AUTH_TIMEOUT_SECONDS",
            DEFAULT_AUTH_TIMEOUT_SECONDS,
        )?;

        let store_timeout_ms =
            parse_positive(vars, "RELAY_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;

        let outbound_buffer =
            parse_positive(vars, "RELAY_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;

        let log_json = match vars.get("RELAY_LOG_JSON").map(|v| v.trim().to_lowercase()) {
            None => false,
            Some(v) if v == "true" || v == "1" => true,
            Some(v) if v == "false" || v == "0" || v.is_empty() => false,
            Some(v) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RELAY_LOG_JSON must be true or false, got '{v}'"
                )));
            }
        };

        Ok(Config {
            bind_address,
            health_bind_address,
            redis_url,
            jwt_public_key,
            jwt_clock_skew: Duration::from_secs(clock_skew_seconds),
            room_capacity,
            rate_limit_window: Duration::from_secs(rate_limit_window_seconds),
            rate_limit_max_messages,
            max_message_bytes,
            auth_timeout: Duration::from_secs(auth_timeout_seconds),
            store_timeout: Duration::from_millis(store_timeout_ms),
            outbound_buffer,
            log_json,
        })
    }
}
