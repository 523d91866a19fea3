//! Addressed message routing between connected peers.

use crate::directory::DirectoryService;
use crate::protocol::{ClientMessage, Forwarded, PeerId, ServerMessage};
use std::sync::Arc;

/// Relays signals between peers and broadcasts roster changes
///
/// The router only interprets `type` and `target`; payloads pass through
/// untouched. Unresolvable targets are dropped with a warning.
#[derive(Debug, Clone)]
pub struct SignalingRouter {
    directory: Arc<DirectoryService>,
}

impl SignalingRouter {
    /// Create a router over a directory
    pub fn new(directory: Arc<DirectoryService>) -> Self {
        Self { directory }
    }

    /// The directory this router resolves targets against
    pub fn directory(&self) -> &Arc<DirectoryService> {
        &self.directory
    }

    /// Deliver `msg` from `sender` to its target
    ///
    /// Returns `true` when the message was queued for delivery.
    pub async fn route(&self, sender: &PeerId, msg: ClientMessage) -> bool {
        let Some(conn) = self.directory.connection(&msg.target).await else {
            tracing::warn!(
                "Dropping {} from {}: target {} not connected",
                msg.kind,
                sender,
                msg.target
            );
            return false;
        };

        let forwarded = Forwarded {
            kind: msg.kind,
            sender: sender.clone(),
            payload: msg.payload,
        };

        if conn.send(forwarded.into()).is_err() {
            tracing::warn!(
                "Dropping {} from {}: target {} is closing",
                msg.kind,
                sender,
                msg.target
            );
            return false;
        }

        tracing::debug!("Routed {} from {} to {}", msg.kind, sender, msg.target);
        true
    }

    /// Send `msg` to every connected peer
    pub async fn broadcast(&self, msg: ServerMessage) {
        let reached = self.directory.broadcast(&msg).await;
        tracing::debug!("Broadcast to {} peers", reached);
    }

    /// Broadcast the current roster to every connected peer
    pub async fn broadcast_roster(&self) {
        let count = self.directory.broadcast_roster().await;
        tracing::debug!("Broadcast roster of {} peers", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DirectoryUpdate, SignalKind};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_route_forwards_with_sender() {
        let dir = Arc::new(DirectoryService::new());
        let router = SignalingRouter::new(dir.clone());

        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = dir.register(a_tx, "Linux", None).await;
        let b = dir.register(b_tx, "Mac", None).await;

        let msg = ClientMessage::new(SignalKind::Offer, b.id.clone(), json!({"sessionId": "s1"}));
        assert!(router.route(&a.id, msg).await);

        match b_rx.recv().await.unwrap() {
            ServerMessage::Signal(fwd) => {
                assert_eq!(fwd.kind, SignalKind::Offer);
                assert_eq!(fwd.sender, a.id);
                assert_eq!(fwd.payload, json!({"sessionId": "s1"}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_unknown_target_dropped() {
        let dir = Arc::new(DirectoryService::new());
        let router = SignalingRouter::new(dir.clone());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let a = dir.register(a_tx, "Linux", None).await;

        let msg = ClientMessage::new(SignalKind::Invite, PeerId::from("nobody"), json!({}));
        assert!(!router.route(&a.id, msg).await);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_preserves_order() {
        let dir = Arc::new(DirectoryService::new());
        let router = SignalingRouter::new(dir.clone());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = dir.register(a_tx, "Linux", None).await;
        let b = dir.register(b_tx, "Linux", None).await;

        for i in 0..20 {
            let msg = ClientMessage::new(SignalKind::IceCandidate, b.id.clone(), json!(i));
            router.route(&a.id, msg).await;
        }
        for i in 0..20 {
            match b_rx.recv().await.unwrap() {
                ServerMessage::Signal(fwd) => assert_eq!(fwd.payload, json!(i)),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_queues() {
        let dir = Arc::new(DirectoryService::new());
        let router = SignalingRouter::new(dir.clone());
        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        dir.register(open_tx, "Linux", None).await;
        dir.register(closed_tx, "Linux", None).await;
        drop(closed_rx);

        let msg: ServerMessage = DirectoryUpdate::UserList { data: Vec::new() }.into();
        assert_eq!(dir.broadcast(&msg).await, 1);
        router.broadcast(msg.clone()).await;
        assert_eq!(open_rx.recv().await.unwrap(), msg);
        assert_eq!(open_rx.recv().await.unwrap(), msg);
    }

    /// Last roster each survivor holds, after draining its queue
    fn last_roster(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Option<Vec<PeerId>> {
        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::Directory(DirectoryUpdate::UserList { data }) = msg {
                let mut ids: Vec<PeerId> = data.into_iter().map(|p| p.id).collect();
                ids.sort();
                last = Some(ids);
            }
        }
        last
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_ends_on_current_roster() {
        let dir = Arc::new(DirectoryService::new());
        let router = SignalingRouter::new(dir.clone());

        let mut survivors = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            dir.register(tx, "Linux", None).await;
            survivors.push(rx);
        }

        let mut churn = Vec::new();
        for _ in 0..32 {
            let (dir, router) = (dir.clone(), router.clone());
            churn.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                let peer = dir.register(tx, "Linux", None).await;
                router.broadcast_roster().await;
                tokio::task::yield_now().await;
                dir.unregister(&peer.id).await;
                router.broadcast_roster().await;
            }));
        }
        for task in churn {
            task.await.unwrap();
        }

        let mut current: Vec<PeerId> = dir.snapshot().await.into_iter().map(|p| p.id).collect();
        current.sort();
        assert_eq!(current.len(), 3);
        for rx in &mut survivors {
            assert_eq!(last_roster(rx), Some(current.clone()));
        }
    }

    #[tokio::test]
    async fn test_broadcast_roster_reaches_everyone() {
        let dir = Arc::new(DirectoryService::new());
        let router = SignalingRouter::new(dir.clone());
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            dir.register(tx, "Linux", None).await;
            receivers.push(rx);
        }

        router.broadcast_roster().await;

        for rx in &mut receivers {
            match rx.recv().await.unwrap() {
                ServerMessage::Directory(DirectoryUpdate::UserList { data }) => {
                    assert_eq!(data.len(), 3)
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
