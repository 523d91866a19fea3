//! Signaling protocol message definitions.
//!
//! Every message is a JSON text frame. Clients address a peer with
//! `{type, target, payload}`; the server delivers it as
//! `{type, sender, payload}`. Directory updates use `{type, data}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque peer identifier assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an identifier string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A device registered in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Server-assigned identifier, never reused
    pub id: PeerId,
    /// Generated human-friendly name
    #[serde(rename = "name")]
    pub display_name: String,
    /// Device label announced by the client
    #[serde(rename = "deviceName")]
    pub device_label: String,
    /// Avatar image reference
    #[serde(rename = "avatar")]
    pub avatar_ref: String,
    /// Remote address as seen by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Join time in milliseconds since the Unix epoch
    #[serde(rename = "joinedAt", default)]
    pub joined_at: u64,
}

/// Kinds of peer-to-peer signals relayed by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Offer of a set of files
    Invite,
    /// Receiver accepted an invite
    Accept,
    /// Receiver declined an invite
    Reject,
    /// Session negotiation offer
    Offer,
    /// Session negotiation answer
    Answer,
    /// Transport address candidate
    IceCandidate,
}

impl SignalKind {
    /// Wire name of the signal
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client to server: an addressed signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Signal kind
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Recipient peer
    pub target: PeerId,
    /// Opaque payload, never inspected by the server
    #[serde(default)]
    pub payload: Value,
}

impl ClientMessage {
    /// Build a signal for `target`
    pub fn new(kind: SignalKind, target: PeerId, payload: Value) -> Self {
        Self {
            kind,
            target,
            payload,
        }
    }
}

/// Server to client: a signal relayed from another peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forwarded {
    /// Signal kind
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Originating peer
    pub sender: PeerId,
    /// Opaque payload
    #[serde(default)]
    pub payload: Value,
}

/// Server to client: directory state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DirectoryUpdate {
    /// The receiving client's own record, sent once after registration
    UserInfo {
        /// Own peer record
        data: Peer,
    },
    /// Full roster, broadcast on every membership change
    UserList {
        /// Every connected peer
        data: Vec<Peer>,
    },
}

/// Any message the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Directory state
    Directory(DirectoryUpdate),
    /// Relayed signal
    Signal(Forwarded),
}

impl ServerMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl From<DirectoryUpdate> for ServerMessage {
    fn from(update: DirectoryUpdate) -> Self {
        Self::Directory(update)
    }
}

impl From<Forwarded> for ServerMessage {
    fn from(signal: Forwarded) -> Self {
        Self::Signal(signal)
    }
}
