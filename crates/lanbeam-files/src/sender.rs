//! Chunked file sender.

use crate::channel::{ChannelMessage, FrameChannel};
use crate::error::{FrameError, TransferError};
use crate::flow::FlowController;
use crate::frame::{ControlFrame, DataFrame};
use crate::{DEFAULT_CHUNK_SIZE, FileMetadata, MAX_TRANSFER_ID_LEN};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Streams files over a [`FrameChannel`]
///
/// Each file is sent as one `file-start`, a run of data frames of at most
/// `chunk_size` payload bytes, and one `file-end`. Only one chunk is held in
/// memory at a time.
#[derive(Debug)]
pub struct FileSender {
    chunk_size: usize,
    flow: FlowController,
}

impl FileSender {
    /// Create a sender
    ///
    /// A zero `chunk_size` is raised to one byte.
    pub fn new(chunk_size: usize, flow: FlowController) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            flow,
        }
    }

    /// Payload bytes per data frame
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Flow controller applied before every data frame
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Send the file at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or the transfer fails.
    pub async fn send_path<C, P>(
        &self,
        channel: &C,
        meta: &FileMetadata,
        path: &Path,
        progress: P,
    ) -> Result<u64, TransferError>
    where
        C: FrameChannel + ?Sized,
        P: FnMut(u64, u64) + Send,
    {
        let file = tokio::fs::File::open(path).await?;
        self.send(channel, meta, file, progress).await
    }

    /// Stream `reader` as the file described by `meta`
    ///
    /// `progress` is called with `(bytes_sent, total)` after every data frame
    /// and once for an empty file.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer id is invalid, reading fails, or the
    /// channel closes. No `file-end` is sent after an error.
    pub async fn send<C, R, P>(
        &self,
        channel: &C,
        meta: &FileMetadata,
        mut reader: R,
        mut progress: P,
    ) -> Result<u64, TransferError>
    where
        C: FrameChannel + ?Sized,
        R: AsyncRead + Unpin + Send,
        P: FnMut(u64, u64) + Send,
    {
        if meta.id.is_empty() || meta.id.len() > MAX_TRANSFER_ID_LEN {
            return Err(FrameError::InvalidIdLength(meta.id.len()).into());
        }

        tracing::debug!("Sending {} ({} bytes) as {}", meta.name, meta.size, meta.id);
        channel
            .send(ChannelMessage::Text(ControlFrame::start(meta).encode()?))
            .await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;

        loop {
            let n = fill(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }

            self.flow.ready(channel).await?;
            let frame = DataFrame::new(&meta.id, &buf[..n]).encode()?;
            channel.send(ChannelMessage::Binary(frame)).await?;

            sent += n as u64;
            progress(sent, meta.size);
        }

        if sent == 0 {
            progress(0, meta.size);
        }

        channel
            .send(ChannelMessage::Text(ControlFrame::end(&meta.id).encode()?))
            .await?;
        tracing::debug!("Sent {} ({} bytes)", meta.id, sent);

        Ok(sent)
    }
}

impl Default for FileSender {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, FlowController::default())
    }
}

/// Percentage of `total` covered by `done`; an empty total counts as complete
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// Read until `buf` is full or the reader is exhausted
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::RecordingChannel;
    use crate::error::ChannelError;
    use crate::frame::Frame;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn meta(id: &str, size: u64) -> FileMetadata {
        FileMetadata {
            id: id.to_string(),
            name: "data.bin".to_string(),
            size,
            mime: "application/octet-stream".to_string(),
        }
    }

    fn data_lengths(messages: &[ChannelMessage]) -> Vec<usize> {
        messages
            .iter()
            .filter_map(|m| match Frame::decode(m).unwrap() {
                Frame::Data(d) => Some(d.payload.len()),
                Frame::Control(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_frame_sequence() {
        let sender = FileSender::new(4, FlowController::default());
        let ch = RecordingChannel::draining();
        let content = b"0123456789".to_vec();

        let sent = sender
            .send(&ch, &meta("f1", 10), content.as_slice(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(sent, 10);

        let msgs = ch.messages();
        assert_eq!(msgs.len(), 5);
        assert!(matches!(
            Frame::decode(&msgs[0]).unwrap(),
            Frame::Control(ControlFrame::FileStart { size: 10, .. })
        ));
        assert_eq!(data_lengths(&msgs), vec![4, 4, 2]);
        assert_eq!(
            Frame::decode(&msgs[4]).unwrap(),
            Frame::Control(ControlFrame::end("f1"))
        );
    }

    #[tokio::test]
    async fn test_empty_file() {
        let sender = FileSender::default();
        let ch = RecordingChannel::draining();
        let mut calls = Vec::new();

        let sent = sender
            .send(&ch, &meta("e", 0), &b""[..], |done, total| calls.push((done, total)))
            .await
            .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(ch.messages().len(), 2);
        assert_eq!(calls, vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_progress_monotonic() {
        let sender = FileSender::new(3, FlowController::default());
        let ch = RecordingChannel::draining();
        let mut seen = Vec::new();
        sender
            .send(&ch, &meta("p", 7), &[1u8; 7][..], |done, total| {
                seen.push(percent(done, total))
            })
            .await
            .unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_backpressure_pauses_sender() {
        let sender = Arc::new(FileSender::new(10, FlowController::new(15, 5)));
        let ch = Arc::new(RecordingChannel::default());

        let task = {
            let (sender, ch) = (sender.clone(), ch.clone());
            tokio::spawn(async move {
                sender
                    .send(ch.as_ref(), &meta("bp", 40), &[7u8; 40][..], |_, _| {})
                    .await
            })
        };

        // Drain whenever the sender blocks until it finishes
        while !task.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            ch.drain();
        }
        assert_eq!(task.await.unwrap().unwrap(), 40);
        assert!(ch.waits.load(Ordering::SeqCst) >= 1);
        assert!(sender.flow().pauses() >= 1);
    }

    #[tokio::test]
    async fn test_closed_channel_fails() {
        let sender = FileSender::default();
        let ch = RecordingChannel::draining();
        ch.close();
        let err = sender
            .send(&ch, &meta("c", 3), &b"abc"[..], |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Channel(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_before_sending() {
        let sender = FileSender::default();
        let ch = RecordingChannel::draining();
        let long = "x".repeat(300);
        let err = sender
            .send(&ch, &meta(&long, 1), &b"a"[..], |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Frame(FrameError::InvalidIdLength(300))));
        assert!(ch.messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        tokio::fs::write(&path, vec![5u8; 1000]).await.unwrap();

        let sender = FileSender::new(256, FlowController::default());
        let ch = RecordingChannel::draining();
        let sent = sender
            .send_path(&ch, &meta("sp", 1000), &path, |_, _| {})
            .await
            .unwrap();
        assert_eq!(sent, 1000);
        assert_eq!(data_lengths(&ch.messages()), vec![256, 256, 256, 232]);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(300, 200), 100.0);
    }
}
