//! Signaling error types.

use thiserror::Error;

/// Errors raised by the signaling server and client
#[derive(Debug, Error)]
pub enum SignalError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message could not be encoded or decoded
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Server URL could not be parsed
    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Connection is not open
    #[error("Signaling connection closed")]
    Closed,
}

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, SignalError>;
