//! Error types for streamgate.

use thiserror::Error;

use crate::state::ConnectionState;

/// Result type alias for streaming client operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur in streaming client operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Socket-level failure. Absorbed by the reconnect loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound frame could not be decoded. Logged and dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller's plan does not include live streaming.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Reconnection gave up.
    #[error("max retries exceeded after {attempts} attempts: {reason}")]
    MaxRetriesExceeded {
        /// Reconnect attempts made before giving up.
        attempts: u32,
        /// Reason reported by the last closure.
        reason: String,
    },

    /// Operation requires an open socket.
    #[error("not connected")]
    NotConnected,

    /// No token was supplied and no ambient session credential exists.
    #[error("no credential available for endpoint {0}")]
    MissingCredential(String),

    /// Endpoint URL could not be built.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Connection state machine rejected a transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State before the attempted transition.
        from: ConnectionState,
        /// Requested state.
        to: ConnectionState,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Outbound message could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// `connect` was called outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl StreamError {
    /// Whether this error is terminal for the caller's session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied(_) | Self::MaxRetriesExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
