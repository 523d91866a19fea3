//! Ordered message channel over a byte stream.
//!
//! A [`DataChannel`] owns one reader task and one writer task over a split
//! stream. Messages are length-prefixed:
//!
//! ```text
//! ┌────────┬──────────────┬───────────────┐
//! │ kind   │ length (BE)  │ bytes         │
//! │ 1 byte │ 4 bytes      │ length bytes  │
//! └────────┴──────────────┴───────────────┘
//!   kind 0 = text, 1 = binary
//! ```
//!
//! `send` only queues. The buffered counter covers queued bytes that the
//! writer task has not yet handed to the socket; every write wakes
//! [`FrameChannel::wait_buffered_low`] waiters.

use async_trait::async_trait;
use lanbeam_files::{ChannelError, ChannelMessage, FrameChannel};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, watch};

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

/// Lifecycle of a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting messages
    Open,
    /// Closed locally
    Closed,
    /// Remote side closed the stream
    Disconnected,
    /// Stream I/O failed
    Failed,
}

impl ChannelState {
    /// Whether the channel can no longer carry messages
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Write one message
pub async fn write_message<W>(writer: &mut W, msg: &ChannelMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (kind, bytes) = match msg {
        ChannelMessage::Text(text) => (KIND_TEXT, text.as_bytes()),
        ChannelMessage::Binary(bytes) => (KIND_BINARY, bytes.as_slice()),
    };
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one message; `None` on a clean end of stream
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> io::Result<Option<ChannelMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {len} bytes exceeds limit of {max_size}"),
        ));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;

    match header[0] {
        KIND_TEXT => String::from_utf8(bytes)
            .map(|text| Some(ChannelMessage::Text(text)))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "text message is not UTF-8")),
        KIND_BINARY => Ok(Some(ChannelMessage::Binary(bytes))),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown message kind {other}"),
        )),
    }
}

/// Bidirectional ordered message channel
pub struct DataChannel {
    label: String,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    buffered: Arc<AtomicU64>,
    drained: Arc<Notify>,
    state: Arc<watch::Sender<ChannelState>>,
    max_message_size: usize,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

/// Move `state` out of `Open`; later transitions are ignored
fn mark(state: &watch::Sender<ChannelState>, drained: &Notify, next: ChannelState) -> bool {
    let changed = state.send_if_modified(|current| {
        if *current == ChannelState::Open {
            *current = next;
            true
        } else {
            false
        }
    });
    if changed {
        drained.notify_waiters();
    }
    changed
}

impl DataChannel {
    /// Start a channel over `stream`
    ///
    /// Returns the channel and the stream of inbound messages. The inbound
    /// stream ends when the channel reaches a terminal state.
    pub fn open<S>(
        stream: S,
        label: impl Into<String>,
        max_message_size: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelMessage>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChannelState::Open);
        let state = Arc::new(state_tx);
        let buffered = Arc::new(AtomicU64::new(0));
        let drained = Arc::new(Notify::new());

        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(write_loop(
            label.clone(),
            writer,
            out_rx,
            buffered.clone(),
            drained.clone(),
            state.clone(),
        ));
        tokio::spawn(read_loop(
            label.clone(),
            reader,
            in_tx,
            max_message_size,
            drained.clone(),
            state.clone(),
        ));

        tracing::debug!("Data channel {} open", label);

        let channel = Arc::new(Self {
            label,
            outbound: out_tx,
            buffered,
            drained,
            state,
            max_message_size,
        });
        (channel, in_rx)
    }

    /// Channel label, used in logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until every queued message has been handed to the stream
    ///
    /// Returns `false` if `limit` passes first or the channel ends.
    pub async fn flush(&self, limit: Duration) -> bool {
        matches!(
            tokio::time::timeout(limit, self.wait_buffered_low(0)).await,
            Ok(Ok(()))
        )
    }

    /// Close the channel; messages still queued are discarded, so
    /// [`flush`](Self::flush) first to deliver them
    pub fn close(&self) {
        if mark(&self.state, &self.drained, ChannelState::Closed) {
            tracing::debug!("Data channel {} closed locally", self.label);
        }
    }

    /// Wait until the channel reaches a terminal state
    pub async fn closed(&self) -> ChannelState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => ChannelState::Closed,
        }
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        mark(&self.state, &self.drained, ChannelState::Closed);
    }
}

#[async_trait]
impl FrameChannel for DataChannel {
    async fn send(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        if self.state().is_terminal() {
            return Err(ChannelError::Closed);
        }
        let len = msg.len();
        if len > self.max_message_size {
            return Err(ChannelError::TooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        self.buffered.fetch_add(len as u64, Ordering::AcqRel);
        self.outbound.send(msg).map_err(|_| {
            self.buffered.fetch_sub(len as u64, Ordering::AcqRel);
            ChannelError::Closed
        })
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    async fn wait_buffered_low(&self, threshold: u64) -> Result<(), ChannelError> {
        loop {
            let notified = self.drained.notified();
            if self.state().is_terminal() {
                return Err(ChannelError::Closed);
            }
            if self.buffered_amount() <= threshold {
                return Ok(());
            }
            notified.await;
        }
    }

    fn is_open(&self) -> bool {
        !self.state().is_terminal()
    }
}

async fn write_loop<W>(
    label: String,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    buffered: Arc<AtomicU64>,
    drained: Arc<Notify>,
    state: Arc<watch::Sender<ChannelState>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut state_rx = state.subscribe();

    loop {
        let msg = tokio::select! {
            _ = state_rx.wait_for(|s| s.is_terminal()) => break,
            next = outbound.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };

        // A stalled socket must not outlive a local close
        let written = tokio::select! {
            _ = state_rx.wait_for(|s| s.is_terminal()) => break,
            res = write_message(&mut writer, &msg) => res,
        };

        if let Err(e) = written {
            tracing::debug!("Data channel {} write failed: {}", label, e);
            mark(&state, &drained, ChannelState::Failed);
            break;
        }
        buffered.fetch_sub(msg.len() as u64, Ordering::AcqRel);
        drained.notify_waiters();
    }

    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    label: String,
    mut reader: R,
    inbound: mpsc::UnboundedSender<ChannelMessage>,
    max_message_size: usize,
    drained: Arc<Notify>,
    state: Arc<watch::Sender<ChannelState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut state_rx = state.subscribe();

    loop {
        tokio::select! {
            _ = state_rx.wait_for(|s| s.is_terminal()) => break,
            read = read_message(&mut reader, max_message_size) => match read {
                Ok(Some(msg)) => {
                    // Receiver gone means nobody consumes; keep draining the socket
                    let _ = inbound.send(msg);
                }
                Ok(None) => {
                    tracing::debug!("Data channel {} closed by remote", label);
                    mark(&state, &drained, ChannelState::Disconnected);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Data channel {} read failed: {}", label, e);
                    mark(&state, &drained, ChannelState::Failed);
                    break;
                }
            },
        }
    }
}
