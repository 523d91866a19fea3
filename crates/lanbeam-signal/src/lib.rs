//! # LANBEAM Signal
//!
//! Signaling plane for LANBEAM. Devices on the same network connect to a
//! single WebSocket server which keeps a live directory of peers and relays
//! addressed control messages between them.
//!
//! This crate provides:
//! - Wire protocol types for directory updates and routed signals
//! - Peer directory with generated display names and avatars
//! - Message router with per-connection FIFO delivery
//! - WebSocket server hosting the directory and router
//! - Reconnecting WebSocket client
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   {type,target,payload}   ┌───────────────────────────┐
//!  │ client A │ ────────────────────────► │        SignalServer       │
//!  └──────────┘                           │ ┌─────────────┐ ┌───────┐ │
//!       ▲        user-info / user-list    │ │  Directory  │ │Router │ │
//!       └──────────────────────────────── │ └─────────────┘ └───────┘ │
//!  ┌──────────┐   {type,sender,payload}   │                           │
//!  │ client B │ ◄──────────────────────── │                           │
//!  └──────────┘                           └───────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod directory;
pub mod error;
pub mod names;
pub mod protocol;
pub mod router;
pub mod server;

pub use client::{SignalClient, SignalClientConfig, SignalEvent, SignalSender};
pub use directory::{Connection, DirectoryService};
pub use error::{Result, SignalError};
pub use protocol::{
    ClientMessage, DirectoryUpdate, Forwarded, Peer, PeerId, ServerMessage, SignalKind,
};
pub use router::SignalingRouter;
pub use server::{SignalServer, SignalServerConfig};

/// Default TCP port of the signaling server
pub const DEFAULT_PORT: u16 = 4927;

/// Device label used when a client does not announce one
pub const UNKNOWN_DEVICE: &str = "Unknown Device";
