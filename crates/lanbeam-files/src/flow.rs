//! Buffered-amount backpressure.

use crate::channel::FrameChannel;
use crate::error::ChannelError;
use crate::{DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER};
use std::sync::atomic::{AtomicU64, Ordering};

/// Pauses a sender while a channel holds too many unsent bytes
///
/// ```text
///  buffered
///     │      ┌─ high water: stop queueing
///  2M ┤──────┼──────────────
///     │     ╱ ╲
///     │    ╱   ╲
/// 64K ┤───╱─────╲────────── low water: resume
///     └──────────────────── time
/// ```
#[derive(Debug)]
pub struct FlowController {
    high_water: u64,
    low_water: u64,
    pauses: AtomicU64,
}

impl FlowController {
    /// Create a controller
    ///
    /// `low_water` is clamped to `high_water`.
    pub fn new(high_water: u64, low_water: u64) -> Self {
        Self {
            high_water,
            low_water: low_water.min(high_water),
            pauses: AtomicU64::new(0),
        }
    }

    /// Pause threshold
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Resume threshold
    pub fn low_water(&self) -> u64 {
        self.low_water
    }

    /// Number of times a sender had to wait
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Wait until `channel` may take another frame
    ///
    /// Returns immediately while the buffered amount is at or below the
    /// high-water mark; otherwise waits for it to fall to the low-water mark.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel closes while waiting.
    pub async fn ready<C>(&self, channel: &C) -> Result<(), ChannelError>
    where
        C: FrameChannel + ?Sized,
    {
        let buffered = channel.buffered_amount();
        if buffered <= self.high_water {
            return Ok(());
        }

        self.pauses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "Buffered {} bytes exceeds {}, waiting for {}",
            buffered,
            self.high_water,
            self.low_water
        );
        channel.wait_buffered_low(self.low_water).await
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMessage;
    use crate::channel::mock::RecordingChannel;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_below_high_water() {
        let flow = FlowController::new(100, 10);
        let ch = RecordingChannel::default();
        ch.send(ChannelMessage::Binary(vec![0; 100])).await.unwrap();

        flow.ready(&ch).await.unwrap();
        assert_eq!(flow.pauses(), 0);
    }

    #[tokio::test]
    async fn test_waits_until_drained() {
        let flow = Arc::new(FlowController::new(100, 10));
        let ch = Arc::new(RecordingChannel::default());
        ch.send(ChannelMessage::Binary(vec![0; 101])).await.unwrap();

        let waiter = {
            let (flow, ch) = (flow.clone(), ch.clone());
            tokio::spawn(async move { flow.ready(ch.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ch.drain();
        waiter.await.unwrap().unwrap();
        assert_eq!(flow.pauses(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let flow = Arc::new(FlowController::new(0, 0));
        let ch = Arc::new(RecordingChannel::default());
        ch.send(ChannelMessage::Binary(vec![1])).await.unwrap();

        let waiter = {
            let (flow, ch) = (flow.clone(), ch.clone());
            tokio::spawn(async move { flow.ready(ch.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.close();

        assert_eq!(waiter.await.unwrap(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_low_water_clamped() {
        let flow = FlowController::new(10, 50);
        assert_eq!(flow.low_water(), 10);
        assert_eq!(FlowController::default().high_water(), DEFAULT_HIGH_WATER);
    }
}
