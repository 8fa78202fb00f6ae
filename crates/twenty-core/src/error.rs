//! Error types for the Twenty Questions protocol

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, GameError>;

/// Protocol error types
#[derive(Debug, Error)]
pub enum GameError {
    /// Envelope could not be decoded
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Messaging transport failure (connect, publish, receive)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Peer failed the shared-secret handshake
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Channel or peer is unknown to the messaging fabric
    #[error("Not found: {0}")]
    NotFound(String),

    /// Reasoning backend failed or returned garbage
    #[error("Reasoning error: {0}")]
    ReasoningError(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Envelope is valid but not actionable in the current phase
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<serde_json::Error> for GameError {
    fn from(err: serde_json::Error) -> Self {
        GameError::SerializationError(err.to_string())
    }
}

impl GameError {
    /// Transient errors are retried by receive loops instead of ending the round
    pub fn is_transient(&self) -> bool {
        matches!(self, GameError::TransportError(_) | GameError::Timeout(_))
    }
}
