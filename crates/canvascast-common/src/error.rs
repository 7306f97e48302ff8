//! Common error types for Canvascast.

use thiserror::Error;

/// Result type alias using Canvascast's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Canvascast operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket bind, file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding of a signal or its payload failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote peer sent something the handshake cannot use
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The real-time transport engine rejected an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// The underlying WebSocket failed
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The signaling channel is closed (remote hung up or we closed it)
    #[error("signaling channel closed")]
    ChannelClosed,

    /// The whiteboard relay no longer accepts packets
    #[error("relay closed")]
    RelayClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a websocket error from any displayable type.
    pub fn websocket(msg: impl std::fmt::Display) -> Self {
        Self::WebSocket(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// True when the error only means the remote end went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::WebSocket(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
