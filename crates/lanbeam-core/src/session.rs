//! Per-peer session state and negotiation payloads.
//!
//! ```text
//!   none ──create/offer──► negotiating ──channel open──► open
//!                               │                          │
//!                               └────── teardown ──────────┴──► closed (removed)
//! ```

use crate::channel::{ChannelState, DataChannel};
use crate::error::{NodeError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Which side started negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the offer and listens for the data connection
    Offerer,
    /// Answered and dials the offerer's candidates
    Answerer,
}

/// Negotiation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Offer/answer in flight, no data channel yet
    Negotiating,
    /// Data channel open
    Open,
}

/// Transport state reported to the session owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Negotiation started
    Connecting,
    /// Data channel open
    Connected,
    /// Remote side went away
    Disconnected,
    /// Transport error
    Failed,
    /// Closed locally
    Closed,
}

impl ConnectionState {
    /// Whether the session is gone
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl From<ChannelState> for ConnectionState {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Open => Self::Connected,
            ChannelState::Closed => Self::Closed,
            ChannelState::Disconnected => Self::Disconnected,
            ChannelState::Failed => Self::Failed,
        }
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Sent by the offerer
    Offer,
    /// Sent by the answerer
    Answer,
}

/// Offer/answer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Session identifier chosen by the offerer
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl SessionDescription {
    /// Offer for a new session
    pub fn offer(session_id: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            session_id: session_id.into(),
        }
    }

    /// Answer to an offer
    pub fn answer(session_id: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            session_id: session_id.into(),
        }
    }
}

/// Address candidate payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Session the candidate belongs to
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// `ip:port` of a data channel listener
    pub candidate: String,
}

impl IceCandidate {
    /// Parse the candidate address
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Negotiation`] if the address is malformed.
    pub fn addr(&self) -> Result<SocketAddr> {
        self.candidate
            .parse()
            .map_err(|_| NodeError::negotiation("malformed candidate address"))
    }
}

/// First message on a freshly dialed data connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHello {
    /// Session the connection belongs to
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Random 128-bit session identifier
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Session with one remote peer
pub(crate) struct Session {
    pub(crate) session_id: String,
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    pub(crate) answered: bool,
    pub(crate) remote_candidates: Vec<SocketAddr>,
    /// Data channel slot; `wait_channel` subscribes here
    pub(crate) channel: watch::Sender<Option<Arc<DataChannel>>>,
    /// Listener and dialer tasks, aborted on teardown
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(session_id: String, role: Role) -> Self {
        let (channel, _) = watch::channel(None);
        Self {
            session_id,
            role,
            state: SessionState::Negotiating,
            answered: false,
            remote_candidates: Vec::new(),
            channel,
            tasks: Vec::new(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(channel) = self.channel.borrow().as_ref() {
            channel.close();
        }
    }
}
