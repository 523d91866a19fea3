//! Error types for framing, channels and transfers.

use thiserror::Error;

/// Frame encoding and decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Transfer id empty or longer than 255 bytes
    #[error("Invalid transfer id length: {0}")]
    InvalidIdLength(usize),

    /// Binary frame shorter than its declared header
    #[error("Truncated frame: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length implied by the header
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Transfer id is not valid UTF-8
    #[error("Transfer id is not valid UTF-8")]
    InvalidUtf8,

    /// Control frame JSON could not be parsed
    #[error("Malformed control frame: {0}")]
    MalformedControl(String),
}

/// Data channel errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel closed locally or by the remote side
    #[error("Channel closed")]
    Closed,

    /// Underlying transport failed
    #[error("Channel I/O error: {0}")]
    Io(String),

    /// Message exceeds the channel's maximum size
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Message size
        size: usize,
        /// Channel limit
        max: usize,
    },
}

/// Errors that end a single file transfer
#[derive(Debug, Error)]
pub enum TransferError {
    /// Channel failed mid-transfer
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Frame could not be built
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Local file I/O failed
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}
