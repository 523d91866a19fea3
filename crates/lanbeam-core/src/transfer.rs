//! Transfer records kept by a node.
//!
//! Outbound sends are [`TransferTask`]s, one per (file, peer). Offers from
//! other peers are [`IncomingTransfer`]s, one per invite (later invites from
//! the same sender merge into a pending or receiving record).

use crate::error::Result;
use crate::scheduler::TaskKey;
use lanbeam_files::FileMetadata;
use lanbeam_signal::PeerId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random lowercase base36 string
fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Id for an offered file (8 base36 characters)
pub fn new_file_id() -> String {
    random_id(8)
}

/// Id for an incoming transfer record (7 base36 characters)
pub fn new_incoming_id() -> String {
    random_id(7)
}

/// Guess a MIME type from the file extension
pub fn guess_mime(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("7z") => "application/x-7z-compressed",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// File description carried in an invite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Id unique within the sender
    pub id: String,
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(rename = "type", default)]
    pub mime: String,
}

impl FileInfo {
    /// Describe the file at `path` under a fresh id
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the path cannot be read or is not a file.
    pub async fn stat(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            )
            .into());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime = guess_mime(&name).to_string();
        Ok(Self {
            id: new_file_id(),
            name,
            size: meta.len(),
            mime,
        })
    }

    /// Metadata for the `file-start` frame
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime: self.mime.clone(),
        }
    }
}

/// Payload of an `invite` signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    /// Offered files
    pub files: Vec<FileInfo>,
}

/// Outbound send state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Invited, waiting for the peer's answer
    Pending,
    /// Accepted; queued or sending
    Transferring,
    /// All bytes handed to the channel
    Completed,
    /// Send failed or the session dropped
    Error,
    /// Peer declined or left
    Rejected,
}

impl TaskStatus {
    /// Whether the task can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Rejected)
    }
}

/// One file being sent to one peer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTask {
    /// File offered
    pub file: FileInfo,
    /// Local source
    pub path: PathBuf,
    /// Receiving peer
    pub target: PeerId,
    /// Current state
    pub status: TaskStatus,
    /// Percent sent, 0 to 100
    pub progress: f64,
}

impl TransferTask {
    /// New pending task
    pub fn new(file: FileInfo, path: PathBuf, target: PeerId) -> Self {
        Self {
            file,
            path,
            target,
            status: TaskStatus::Pending,
            progress: 0.0,
        }
    }

    /// Scheduler key
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.target.clone(), self.file.id.clone())
    }

    /// Move to `next`; terminal tasks never change
    ///
    /// Returns whether the status changed.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        tracing::debug!(
            "Task {} to {}: {:?} -> {:?}",
            self.file.id,
            self.target,
            self.status,
            next
        );
        self.status = next;
        if next == TaskStatus::Completed {
            self.progress = 100.0;
        }
        true
    }
}

/// Inbound offer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncomingStatus {
    /// Waiting for the user
    Pending,
    /// Accepted; data may be arriving
    Receiving,
    /// Every file finished
    Completed,
    /// Declined, failed, or the sender dropped
    Declined,
}

impl IncomingStatus {
    /// Whether the record is finished
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Declined)
    }
}

/// Sum of offered sizes; `None` when it does not fit in a `u64`
///
/// Sizes come from the remote peer, so offers whose total overflows are
/// refused rather than recorded.
pub fn total_size_of(files: &[FileInfo]) -> Option<u64> {
    files.iter().try_fold(0u64, |acc, f| acc.checked_add(f.size))
}

/// Files offered by one sender
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingTransfer {
    /// Local record id
    pub id: String,
    /// Offering peer
    pub sender: PeerId,
    /// Offered files
    pub files: Vec<FileInfo>,
    /// Sum of offered sizes
    pub total_size: u64,
    /// Bytes received per file id
    pub received: HashMap<String, u64>,
    /// Files fully received
    pub completed_files: HashSet<String>,
    /// Current state
    pub status: IncomingStatus,
}

impl IncomingTransfer {
    /// New pending record
    ///
    /// A total past `u64::MAX` saturates; check [`total_size_of`] first to
    /// refuse such offers.
    pub fn new(sender: PeerId, files: Vec<FileInfo>) -> Self {
        let total_size = total_size_of(&files).unwrap_or(u64::MAX);
        Self {
            id: new_incoming_id(),
            sender,
            files,
            total_size,
            received: HashMap::new(),
            completed_files: HashSet::new(),
            status: IncomingStatus::Pending,
        }
    }

    /// Whether later invites from the same sender fold into this record
    pub fn accepts_merge(&self) -> bool {
        matches!(
            self.status,
            IncomingStatus::Pending | IncomingStatus::Receiving
        )
    }

    /// Append files from a later invite; ids already present are skipped
    ///
    /// Returns `false`, leaving the record untouched, when the new total
    /// would overflow.
    pub fn merge(&mut self, files: Vec<FileInfo>) -> bool {
        let mut seen = HashSet::new();
        let fresh: Vec<FileInfo> = files
            .into_iter()
            .filter(|f| !self.contains(&f.id) && seen.insert(f.id.clone()))
            .collect();

        let Some(total) =
            total_size_of(&fresh).and_then(|added| self.total_size.checked_add(added))
        else {
            return false;
        };
        self.total_size = total;
        self.files.extend(fresh);
        true
    }

    /// Whether `file_id` is part of this offer
    pub fn contains(&self, file_id: &str) -> bool {
        self.files.iter().any(|f| f.id == file_id)
    }

    /// Record bytes received so far for one file
    pub fn record(&mut self, file_id: &str, received: u64) {
        self.received.insert(file_id.to_string(), received);
    }

    /// Mark one file finished
    ///
    /// Returns `true` when this completes the whole transfer.
    pub fn complete_file(&mut self, file_id: &str, received: u64) -> bool {
        self.record(file_id, received);
        self.completed_files.insert(file_id.to_string());
        let done = self.files.iter().all(|f| self.completed_files.contains(&f.id));
        if done && self.status == IncomingStatus::Receiving {
            self.status = IncomingStatus::Completed;
        }
        done
    }

    /// Percent received across all files, 0 to 100
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == IncomingStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        let received = self
            .received
            .values()
            .fold(0u64, |acc, n| acc.saturating_add(*n));
        (received as f64 / self.total_size as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, size: u64) -> FileInfo {
        FileInfo {
            id: id.into(),
            name: format!("{id}.bin"),
            size,
            mime: "application/octet-stream".into(),
        }
    }

    #[test]
    fn test_ids() {
        let id = new_file_id();
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
        assert_eq!(new_incoming_id().len(), 7);
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("archive.tar.gz"), "application/gzip");
        assert_eq!(guess_mime("README"), "application/octet-stream");
    }

    #[test]
    fn test_invite_wire_format() {
        let invite = InvitePayload {
            files: vec![info("abc", 3)],
        };
        let json = serde_json::to_value(&invite).unwrap();
        assert_eq!(json["files"][0]["type"], "application/octet-stream");
        assert_eq!(json["files"][0]["size"], 3);
        let back: InvitePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, invite);
    }

    #[tokio::test]
    async fn test_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, vec![0u8; 42]).await.unwrap();

        let file = FileInfo::stat(&path).await.unwrap();
        assert_eq!(file.name, "clip.mp4");
        assert_eq!(file.size, 42);
        assert_eq!(file.mime, "video/mp4");

        assert!(FileInfo::stat(dir.path()).await.is_err());
        assert!(FileInfo::stat(&dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn test_terminal_task_never_changes() {
        let mut task = TransferTask::new(info("a", 1), "a.bin".into(), PeerId::from("p"));
        assert!(task.transition(TaskStatus::Transferring));
        assert!(task.transition(TaskStatus::Completed));
        assert_eq!(task.progress, 100.0);
        assert!(!task.transition(TaskStatus::Error));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_merge_and_progress() {
        let mut incoming = IncomingTransfer::new(PeerId::from("s"), vec![info("a", 100)]);
        assert!(incoming.accepts_merge());
        assert!(incoming.merge(vec![info("b", 300), info("a", 100), info("b", 300)]));
        assert_eq!(incoming.files.len(), 2);
        assert_eq!(incoming.total_size, 400);

        incoming.status = IncomingStatus::Receiving;
        incoming.record("b", 100);
        assert_eq!(incoming.progress(), 25.0);

        assert!(!incoming.complete_file("a", 100));
        assert!(incoming.complete_file("b", 300));
        assert_eq!(incoming.status, IncomingStatus::Completed);
        assert_eq!(incoming.progress(), 100.0);
        assert!(!incoming.accepts_merge());
    }

    #[test]
    fn test_overflowing_offer_refused() {
        let huge = vec![info("a", u64::MAX), info("b", 1)];
        assert_eq!(total_size_of(&huge), None);
        assert_eq!(total_size_of(&[info("a", 2), info("b", 3)]), Some(5));

        let mut incoming = IncomingTransfer::new(PeerId::from("s"), vec![info("a", u64::MAX - 1)]);
        assert!(!incoming.merge(vec![info("b", 1), info("c", 1)]));
        assert_eq!(incoming.files.len(), 1);
        assert_eq!(incoming.total_size, u64::MAX - 1);

        assert!(incoming.merge(vec![info("b", 1)]));
        assert_eq!(incoming.total_size, u64::MAX);

        incoming.status = IncomingStatus::Receiving;
        incoming.record("a", u64::MAX);
        incoming.record("b", u64::MAX);
        assert_eq!(incoming.progress(), 100.0);
    }
}
