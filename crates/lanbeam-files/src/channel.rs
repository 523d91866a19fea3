//! Message channel abstraction used by the sender.

use crate::error::ChannelError;
use async_trait::async_trait;

/// A message on an ordered, reliable data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
}

impl ChannelMessage {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered reliable channel with a buffered byte counter
///
/// `send` queues without waiting for the bytes to leave the host; the
/// buffered amount grows until the transport drains it. Senders combine
/// `buffered_amount` and `wait_buffered_low` to apply backpressure.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// Queue a message
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the channel is no longer open.
    async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError>;

    /// Bytes queued but not yet written to the transport
    fn buffered_amount(&self) -> u64;

    /// Resolve once the buffered amount is at or below `threshold`
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel closes while waiting.
    async fn wait_buffered_low(&self, threshold: u64) -> Result<(), ChannelError>;

    /// Whether the channel accepts messages
    fn is_open(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Records sent messages; buffered bytes only drop when `drain` is called
    /// unless `auto_drain` is set.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub(crate) sent: Mutex<Vec<ChannelMessage>>,
        pub(crate) buffered: AtomicU64,
        pub(crate) waits: AtomicUsize,
        pub(crate) auto_drain: bool,
        closed: AtomicBool,
        drained: Notify,
    }

    impl RecordingChannel {
        pub(crate) fn draining() -> Self {
            Self {
                auto_drain: true,
                ..Default::default()
            }
        }

        pub(crate) fn drain(&self) {
            self.buffered.store(0, Ordering::SeqCst);
            self.drained.notify_waiters();
        }

        pub(crate) fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.drained.notify_waiters();
        }

        pub(crate) fn messages(&self) -> Vec<ChannelMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameChannel for RecordingChannel {
        async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
            if !self.is_open() {
                return Err(ChannelError::Closed);
            }
            if !self.auto_drain {
                self.buffered.fetch_add(msg.len() as u64, Ordering::SeqCst);
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        fn buffered_amount(&self) -> u64 {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn wait_buffered_low(&self, threshold: u64) -> Result<(), ChannelError> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            loop {
                let notified = self.drained.notified();
                if !self.is_open() {
                    return Err(ChannelError::Closed);
                }
                if self.buffered_amount() <= threshold {
                    return Ok(());
                }
                notified.await;
            }
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }
}
