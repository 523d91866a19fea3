//! Receive-side storage.
//!
//! A [`ReceiverSink`] opens one [`SinkWriter`] per incoming file. Writers are
//! fed chunks in order and are either closed (file complete) or aborted
//! (transfer torn down, partial data discarded).

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Incremental writer for one incoming file
#[async_trait]
pub trait SinkWriter: Send {
    /// Append a chunk
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Finish the file
    async fn close(self: Box<Self>) -> io::Result<()>;

    /// Release resources and discard what was written
    async fn abort(self: Box<Self>);
}

/// Factory for [`SinkWriter`]s
#[async_trait]
pub trait ReceiverSink: Send + Sync {
    /// Open a writer for a new incoming file
    ///
    /// # Arguments
    ///
    /// * `transfer_id` - Transfer id announced in `file-start`
    /// * `name` - File name announced by the sender (untrusted)
    /// * `size_hint` - Announced size in bytes
    async fn open(
        &self,
        transfer_id: &str,
        name: &str,
        size_hint: u64,
    ) -> io::Result<Box<dyn SinkWriter>>;
}

/// Writes incoming files into a directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Sink rooted at `dir`; the directory is created on first use
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Reduce an announced name to a bare file name
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('.');
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// `name (n).ext` for the n-th collision
fn numbered(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

#[async_trait]
impl ReceiverSink for DirectorySink {
    async fn open(
        &self,
        transfer_id: &str,
        name: &str,
        size_hint: u64,
    ) -> io::Result<Box<dyn SinkWriter>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = sanitize_file_name(name);

        let mut attempt = 0u32;
        loop {
            let candidate = if attempt == 0 {
                name.clone()
            } else {
                numbered(&name, attempt)
            };
            let path = self.dir.join(&candidate);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    tracing::debug!(
                        "Receiving {} ({} bytes) into {}",
                        transfer_id,
                        size_hint,
                        path.display()
                    );
                    return Ok(Box::new(FileWriter {
                        path,
                        file: BufWriter::new(file),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 10_000 => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct FileWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

#[async_trait]
impl SinkWriter for FileWriter {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await
    }

    async fn close(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await
    }

    async fn abort(self: Box<Self>) {
        let path = self.path.clone();
        drop(self);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

/// State of a file held by [`MemorySink`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFile {
    /// Announced name
    pub name: String,
    /// Bytes written so far
    pub data: Vec<u8>,
    /// Writer was closed normally
    pub closed: bool,
    /// Writer was aborted
    pub aborted: bool,
}

/// Keeps incoming files in memory
///
/// Clones share storage. Files whose name matches the configured failure
/// name reject every write.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<HashMap<String, MemoryFile>>>,
    fail_name: Option<String>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose writers fail for files named `name`
    pub fn failing_on(name: impl Into<String>) -> Self {
        Self {
            fail_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Snapshot of a file by transfer id
    pub fn file(&self, transfer_id: &str) -> Option<MemoryFile> {
        self.lock().get(transfer_id).cloned()
    }

    /// Transfer ids seen so far
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryFile>> {
        // A poisoned map only means a test thread panicked mid-update
        self.files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ReceiverSink for MemorySink {
    async fn open(
        &self,
        transfer_id: &str,
        name: &str,
        _size_hint: u64,
    ) -> io::Result<Box<dyn SinkWriter>> {
        self.lock().insert(
            transfer_id.to_string(),
            MemoryFile {
                name: name.to_string(),
                ..MemoryFile::default()
            },
        );
        Ok(Box::new(MemoryWriter {
            sink: self.clone(),
            id: transfer_id.to_string(),
            fail: self.fail_name.as_deref() == Some(name),
        }))
    }
}

struct MemoryWriter {
    sink: MemorySink,
    id: String,
    fail: bool,
}

#[async_trait]
impl SinkWriter for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::other("sink rejected write"));
        }
        if let Some(file) = self.sink.lock().get_mut(&self.id) {
            file.data.extend_from_slice(chunk);
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        if let Some(file) = self.sink.lock().get_mut(&self.id) {
            file.closed = true;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        if let Some(file) = self.sink.lock().get_mut(&self.id) {
            file.aborted = true;
            file.data.clear();
        }
    }
}
