//! Error types for the collaboration runtime.

use collab_protocol::ErrorPayload;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the collaboration runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish the TCP connection to the server.
    #[error("Failed to connect to collaboration server: {0}")]
    ConnectionFailed(String),

    /// Transport-level error (framing, socket I/O).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Protocol-level error (malformed or unexpected frame).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Server-reported error attached to a reply.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name reported by the server.
        name: String,
        /// Human-readable error message.
        message: String,
    },

    /// The connection dropped before a reply arrived.
    #[error("Connection lost before a reply arrived")]
    ConnectionLost,

    /// Internal channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Timeout waiting for an operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Converts a server-side [`ErrorPayload`] into [`Error::Remote`].
    pub fn remote(payload: ErrorPayload) -> Self {
        Error::Remote {
            name: payload.name.unwrap_or_else(|| "Error".to_string()),
            message: payload.message,
        }
    }

    /// Returns the error name if this is a Remote error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Remote { name, .. } => name == "TimeoutError",
            _ => false,
        }
    }

    /// Returns true if the error means the connection went away.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost | Error::ChannelClosed)
    }
}
