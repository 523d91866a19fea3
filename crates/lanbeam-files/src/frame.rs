//! Transfer frame encoding.
//!
//! Control frames travel as text messages, data frames as binary messages.
//! Data frames carry their transfer id inline so several files can share one
//! channel:
//!
//! ```text
//! ┌────────┬──────────────────┬─────────────────────┐
//! │ idLen  │ transfer id      │ payload             │
//! │ 1 byte │ idLen bytes UTF-8│ remaining bytes     │
//! └────────┴──────────────────┴─────────────────────┘
//! ```

use crate::channel::ChannelMessage;
use crate::error::FrameError;
use crate::{FileMetadata, MAX_TRANSFER_ID_LEN};
use serde::{Deserialize, Serialize};

/// Text control frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// A new file begins on this channel
    FileStart {
        /// Transfer id used by the following data frames
        id: String,
        /// File name
        name: String,
        /// Total size in bytes
        size: u64,
        /// MIME type
        #[serde(default)]
        mime: String,
    },
    /// All data frames for the transfer have been sent
    FileEnd {
        /// Transfer id
        id: String,
    },
}

impl ControlFrame {
    /// `file-start` frame for a file
    pub fn start(meta: &FileMetadata) -> Self {
        Self::FileStart {
            id: meta.id.clone(),
            name: meta.name.clone(),
            size: meta.size,
            mime: meta.mime.clone(),
        }
    }

    /// `file-end` frame for a transfer id
    pub fn end(id: impl Into<String>) -> Self {
        Self::FileEnd { id: id.into() }
    }

    /// Transfer id the frame refers to
    pub fn id(&self) -> &str {
        match self {
            Self::FileStart { id, .. } | Self::FileEnd { id } => id,
        }
    }

    /// Encode as JSON text
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|e| FrameError::MalformedControl(e.to_string()))
    }

    /// Parse JSON text
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|e| FrameError::MalformedControl(e.to_string()))
    }
}

/// Borrowed view of a binary data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    /// Transfer id
    pub id: &'a str,
    /// Chunk bytes
    pub payload: &'a [u8],
}

impl<'a> DataFrame<'a> {
    /// Create a frame view
    pub fn new(id: &'a str, payload: &'a [u8]) -> Self {
        Self { id, payload }
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        1 + self.id.len() + self.payload.len()
    }

    /// Encode into a new buffer
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidIdLength`] if the id is empty or longer
    /// than 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let id = self.id.as_bytes();
        if id.is_empty() || id.len() > MAX_TRANSFER_ID_LEN {
            return Err(FrameError::InvalidIdLength(id.len()));
        }

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(id.len() as u8);
        buf.extend_from_slice(id);
        buf.extend_from_slice(self.payload);
        Ok(buf)
    }

    /// Parse a binary message without copying
    ///
    /// # Errors
    ///
    /// Returns an error if the header is truncated, declares a zero-length
    /// id, or the id is not UTF-8.
    pub fn parse(buf: &'a [u8]) -> Result<Self, FrameError> {
        let Some((&id_len, rest)) = buf.split_first() else {
            return Err(FrameError::Truncated {
                expected: 1,
                actual: 0,
            });
        };

        let id_len = id_len as usize;
        if id_len == 0 {
            return Err(FrameError::InvalidIdLength(0));
        }
        if rest.len() < id_len {
            return Err(FrameError::Truncated {
                expected: 1 + id_len,
                actual: buf.len(),
            });
        }

        let (id, payload) = rest.split_at(id_len);
        let id = std::str::from_utf8(id).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(Self { id, payload })
    }
}

/// Decoded channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Text control frame
    Control(ControlFrame),
    /// Binary data frame
    Data(DataFrame<'a>),
}

impl<'a> Frame<'a> {
    /// Decode a channel message
    pub fn decode(msg: &'a ChannelMessage) -> Result<Self, FrameError> {
        match msg {
            ChannelMessage::Text(text) => ControlFrame::parse(text).map(Frame::Control),
            ChannelMessage::Binary(bytes) => DataFrame::parse(bytes).map(Frame::Data),
        }
    }
}
