//! Error types for a3s-beacon

use thiserror::Error;

/// Errors that can occur while coordinating session status
#[derive(Debug, Error)]
pub enum BeaconError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker rejected or failed a key/value command
    #[error("Broker error: {0}")]
    Broker(String),

    /// Publish failure
    #[error("Failed to publish to channel '{channel}': {reason}")]
    Publish {
        channel: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to channel '{channel}': {reason}")]
    Subscribe {
        channel: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML configuration could not be parsed
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Poll server could not bind its listener
    #[error("Failed to bind status server: {0}")]
    Bind(String),

    /// Current status could not be computed
    #[error("Status unavailable: {0}")]
    Status(String),

    /// A safety rule failed to evaluate
    #[error("Safety rule '{rule}' failed: {reason}")]
    Rule {
        rule: String,
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for beacon operations
pub type Result<T> = std::result::Result<T, BeaconError>;

impl From<redis::RedisError> for BeaconError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            BeaconError::Connection(err.to_string())
        } else {
            BeaconError::Broker(err.to_string())
        }
    }
}

impl axum::response::IntoResponse for BeaconError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            BeaconError::Config(_) | BeaconError::TomlDe(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
