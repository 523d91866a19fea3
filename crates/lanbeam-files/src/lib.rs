//! # LANBEAM Files
//!
//! File streaming engine for LANBEAM.
//!
//! This crate provides:
//! - Control and data frame encoding for multiplexed transfers
//! - Flow control against a channel's buffered byte count
//! - Chunked file sender that never buffers a whole file
//! - Receiver reassembly into pluggable sinks
//!
//! ## Wire Format
//!
//! ```text
//! text   {"type":"file-start","id":"k3x9q2ab","name":"a.bin","size":10,"mime":"..."}
//! binary [idLen:1][id:idLen][payload]            (repeated)
//! text   {"type":"file-end","id":"k3x9q2ab"}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod flow;
pub mod frame;
pub mod receiver;
pub mod sender;
pub mod sink;

pub use channel::{ChannelMessage, FrameChannel};
pub use error::{ChannelError, FrameError, TransferError};
pub use flow::FlowController;
pub use frame::{ControlFrame, DataFrame, Frame};
pub use receiver::{ReceiveEvent, Reassembler};
pub use sender::FileSender;
pub use sink::{DirectorySink, MemorySink, ReceiverSink, SinkWriter};

/// Default data frame payload size (128 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Default buffered byte count above which the sender pauses (2 MiB)
pub const DEFAULT_HIGH_WATER: u64 = 2 * 1024 * 1024;

/// Default buffered byte count at which a paused sender resumes (64 KiB)
pub const DEFAULT_LOW_WATER: u64 = 64 * 1024;

/// Maximum transfer id length in bytes
pub const MAX_TRANSFER_ID_LEN: usize = u8::MAX as usize;

/// Metadata announced in `file-start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Transfer id multiplexing the file on a channel
    pub id: String,
    /// File name
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// MIME type
    pub mime: String,
}
