//! Error types for node operations
//!
//! Errors are categorized to support caller decisions: transient failures
//! (transport, channel, signaling) may succeed if the user tries again;
//! permanent failures need a different input or state.

use lanbeam_files::{ChannelError, TransferError};
use lanbeam_signal::{PeerId, SignalError};
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Data channel failed or closed
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Signaling connection failed
    #[error("Signaling error: {0}")]
    Signaling(Cow<'static, str>),

    // ============ Session Errors ============
    /// A session with the peer already exists
    #[error("Session already exists for peer {0}")]
    DuplicateSession(PeerId),

    /// Negotiation message did not match session state
    #[error("Negotiation failed: {0}")]
    Negotiation(Cow<'static, str>),

    /// No session for the peer
    #[error("Session not found for peer {0}")]
    SessionNotFound(PeerId),

    // ============ Transfer Errors ============
    /// Transfer operation failed
    #[error("Transfer error: {0}")]
    Transfer(Cow<'static, str>),

    /// Unknown transfer id
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Peer not in the current roster
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    // ============ I/O Errors ============
    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Transport(_) | NodeError::Channel(_) | NodeError::Signaling(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::DuplicateSession(_)
                | NodeError::SessionNotFound(_)
                | NodeError::TransferNotFound(_)
                | NodeError::PeerNotFound(_)
                | NodeError::InvalidState(_)
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create a negotiation error with static context (zero allocation)
    #[must_use]
    pub const fn negotiation(context: &'static str) -> Self {
        NodeError::Negotiation(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<ChannelError> for NodeError {
    fn from(err: ChannelError) -> Self {
        NodeError::Channel(Cow::Owned(err.to_string()))
    }
}

impl From<TransferError> for NodeError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Channel(e) => e.into(),
            TransferError::Io(e) => e.into(),
            TransferError::Frame(e) => NodeError::Transfer(Cow::Owned(e.to_string())),
        }
    }
}

impl From<SignalError> for NodeError {
    fn from(err: SignalError) -> Self {
        NodeError::Signaling(Cow::Owned(err.to_string()))
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
