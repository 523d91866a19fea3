//! Receive-side reassembly of multiplexed transfers.

use crate::channel::ChannelMessage;
use crate::frame::{ControlFrame, DataFrame, Frame};
use crate::sink::{ReceiverSink, SinkWriter};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of feeding one channel message to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// A writer was opened for a new transfer
    Started {
        /// Transfer id
        id: String,
        /// Announced file name
        name: String,
        /// Announced size
        size: u64,
    },
    /// A chunk was written
    Progress {
        /// Transfer id
        id: String,
        /// Bytes written so far
        received: u64,
        /// Announced size
        total: u64,
    },
    /// `file-end` arrived and the writer was closed
    Completed {
        /// Transfer id
        id: String,
        /// Bytes written
        received: u64,
    },
    /// The sink failed; the transfer was dropped
    Failed {
        /// Transfer id
        id: String,
        /// Failure description
        error: String,
    },
}

struct Active {
    writer: Box<dyn SinkWriter>,
    total: u64,
    received: u64,
}

/// Routes frames from one channel to per-transfer sink writers
///
/// Frames for ids with no open writer are dropped. A failing writer only
/// affects its own transfer.
pub struct Reassembler {
    sink: Arc<dyn ReceiverSink>,
    active: HashMap<String, Active>,
}

impl Reassembler {
    /// Create a reassembler writing into `sink`
    pub fn new(sink: Arc<dyn ReceiverSink>) -> Self {
        Self {
            sink,
            active: HashMap::new(),
        }
    }

    /// Whether a writer is open for `id`
    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Number of open writers
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Process one channel message
    ///
    /// Returns `None` for frames that were dropped.
    pub async fn handle(&mut self, msg: &ChannelMessage) -> Option<ReceiveEvent> {
        match Frame::decode(msg) {
            Ok(Frame::Control(ControlFrame::FileStart { id, name, size, .. })) => {
                Some(self.start(id, name, size).await)
            }
            Ok(Frame::Control(ControlFrame::FileEnd { id })) => self.finish(id).await,
            Ok(Frame::Data(frame)) => self.write(frame).await,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {}", e);
                None
            }
        }
    }

    async fn start(&mut self, id: String, name: String, size: u64) -> ReceiveEvent {
        if let Some(previous) = self.active.remove(&id) {
            tracing::warn!("Transfer {} restarted, discarding previous data", id);
            previous.writer.abort().await;
        }

        match self.sink.open(&id, &name, size).await {
            Ok(writer) => {
                tracing::debug!("Receiving {} ({}, {} bytes)", id, name, size);
                self.active.insert(
                    id.clone(),
                    Active {
                        writer,
                        total: size,
                        received: 0,
                    },
                );
                ReceiveEvent::Started { id, name, size }
            }
            Err(e) => {
                tracing::warn!("Failed to open sink for {}: {}", id, e);
                ReceiveEvent::Failed {
                    id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn write(&mut self, frame: DataFrame<'_>) -> Option<ReceiveEvent> {
        let Some(active) = self.active.get_mut(frame.id) else {
            tracing::trace!("Dropping chunk for unknown transfer {}", frame.id);
            return None;
        };

        if let Err(e) = active.writer.write(frame.payload).await {
            tracing::warn!("Sink write failed for {}: {}", frame.id, e);
            if let Some(failed) = self.active.remove(frame.id) {
                failed.writer.abort().await;
            }
            return Some(ReceiveEvent::Failed {
                id: frame.id.to_string(),
                error: e.to_string(),
            });
        }

        active.received += frame.payload.len() as u64;
        Some(ReceiveEvent::Progress {
            id: frame.id.to_string(),
            received: active.received,
            total: active.total,
        })
    }

    async fn finish(&mut self, id: String) -> Option<ReceiveEvent> {
        let Some(active) = self.active.remove(&id) else {
            tracing::trace!("Ignoring file-end for unknown transfer {}", id);
            return None;
        };

        let received = active.received;
        match active.writer.close().await {
            Ok(()) => {
                tracing::debug!("Completed {} ({} bytes)", id, received);
                Some(ReceiveEvent::Completed { id, received })
            }
            Err(e) => {
                tracing::warn!("Failed to close sink for {}: {}", id, e);
                Some(ReceiveEvent::Failed {
                    id,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Abort one transfer, discarding partial data
    pub async fn abort(&mut self, id: &str) -> bool {
        match self.active.remove(id) {
            Some(active) => {
                active.writer.abort().await;
                true
            }
            None => false,
        }
    }

    /// Abort every open transfer; returns their ids
    pub async fn abort_all(&mut self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.active.len());
        for (id, active) in self.active.drain() {
            active.writer.abort().await;
            ids.push(id);
        }
        if !ids.is_empty() {
            tracing::debug!("Aborted {} in-progress transfers", ids.len());
        }
        ids
    }
}
