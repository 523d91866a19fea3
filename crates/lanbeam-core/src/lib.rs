//! # LANBEAM Core
//!
//! Peer sessions, data channels, transfer scheduling and the node that ties
//! them to the signaling plane.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Node                                │
//! │  invites · accept/reject · task table · incoming transfers       │
//! ├──────────────────────┬───────────────────────┬───────────────────┤
//! │  TransferScheduler   │    SessionManager     │  receive pumps    │
//! │  (global cap +       │  (offer/answer/       │  (Reassembler per │
//! │   per-peer quota)    │   candidates → TCP)   │   peer channel)   │
//! ├──────────────────────┴───────────┬───────────┴───────────────────┤
//! │            FileSender            │          DataChannel          │
//! │   (file-start · chunks · end)    │  (ordered messages, buffered  │
//! │                                  │   byte count, low-water wake) │
//! └──────────────────────────────────┴───────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod session;
pub mod session_manager;
pub mod transfer;

pub use channel::{ChannelState, DataChannel};
pub use config::{NodeConfig, SchedulerConfig, SessionConfig, SignalingConfig, TransferConfig};
pub use error::{NodeError, Result};
pub use node::{Node, NodeEvent};
pub use scheduler::{Job, QueuedTask, Scheduler, SchedulerStats, TaskKey, TransferScheduler};
pub use session::{ConnectionState, IceCandidate, Role, SessionDescription, SessionState};
pub use session_manager::{SessionEvent, SessionManager};
pub use transfer::{
    FileInfo, IncomingStatus, IncomingTransfer, InvitePayload, TaskStatus, TransferTask,
};

pub use lanbeam_signal::{Peer, PeerId};
