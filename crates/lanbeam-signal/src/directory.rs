//! Live directory of connected peers.

use crate::names::{generate_avatar, generate_unique_name};
use crate::protocol::{DirectoryUpdate, Peer, PeerId, ServerMessage};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, mpsc};

/// Outbound queue of a single client connection
///
/// One writer task drains each queue, so messages pushed here reach the
/// client in the order they were queued.
pub type Connection = mpsc::UnboundedSender<ServerMessage>;

/// Directory entry
#[derive(Debug, Clone)]
struct Registered {
    peer: Peer,
    conn: Connection,
}

/// Registry of connected peers
///
/// Thread-safe; registration generates the display name and inserts the
/// peer under one write guard so concurrent joins never share a name.
#[derive(Debug, Default)]
pub struct DirectoryService {
    /// Registered peers (PeerId -> entry)
    peers: Arc<RwLock<HashMap<PeerId, Registered>>>,
    /// Sequence embedded in every id so ids are never reused
    next_seq: AtomicU64,
}

impl DirectoryService {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    ///
    /// # Arguments
    ///
    /// * `conn` - Outbound queue of the connection
    /// * `device_label` - Label announced by the client
    /// * `ip` - Remote address, when known
    pub async fn register(&self, conn: Connection, device_label: &str, ip: Option<String>) -> Peer {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peers = self.peers.write().await;

        let taken: HashSet<String> = peers
            .values()
            .map(|entry| entry.peer.display_name.clone())
            .collect();

        let (id, display_name, avatar_ref) = {
            let mut rng = rand::thread_rng();
            let suffix: u32 = rng.r#gen();
            (
                PeerId::new(format!("{seq:x}-{suffix:08x}")),
                generate_unique_name(&mut rng, &taken),
                generate_avatar(&mut rng),
            )
        };

        let peer = Peer {
            id: id.clone(),
            display_name,
            device_label: device_label.to_string(),
            avatar_ref,
            ip,
            joined_at: now_millis(),
        };

        peers.insert(
            id,
            Registered {
                peer: peer.clone(),
                conn,
            },
        );

        tracing::info!(
            "Registered peer {} ({}, {}), {} online",
            peer.id,
            peer.display_name,
            peer.device_label,
            peers.len()
        );

        peer
    }

    /// Remove a peer; returns the removed record
    ///
    /// Idempotent: unknown or already removed ids return `None`.
    pub async fn unregister(&self, id: &PeerId) -> Option<Peer> {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(id).map(|entry| entry.peer);
        if let Some(peer) = &removed {
            tracing::info!(
                "Unregistered peer {} ({}), {} online",
                peer.id,
                peer.display_name,
                peers.len()
            );
        }
        removed
    }

    /// Current roster, in no particular order
    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers
            .read()
            .await
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Queue `msg` on every connection; returns how many were reached
    pub async fn broadcast(&self, msg: &ServerMessage) -> usize {
        let peers = self.peers.read().await;
        peers
            .values()
            // Closed queues belong to peers that are about to unregister
            .filter(|entry| entry.conn.send(msg.clone()).is_ok())
            .count()
    }

    /// Queue the current roster on every connection
    ///
    /// Runs under the read guard, so no registration can land between the
    /// snapshot and the sends. The last roster queued on any connection is
    /// therefore never older than the directory. Returns the roster size.
    pub async fn broadcast_roster(&self) -> usize {
        let peers = self.peers.read().await;
        let data: Vec<Peer> = peers.values().map(|entry| entry.peer.clone()).collect();
        let msg: ServerMessage = DirectoryUpdate::UserList { data }.into();
        for entry in peers.values() {
            // Closed queues belong to peers that are about to unregister
            let _ = entry.conn.send(msg.clone());
        }
        peers.len()
    }

    /// Look up a peer's outbound queue
    pub async fn connection(&self, id: &PeerId) -> Option<Connection> {
        self.peers.read().await.get(id).map(|entry| entry.conn.clone())
    }

    /// Number of registered peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the directory is empty
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
