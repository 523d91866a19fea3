//! Two-node test fixture for integration testing
//!
//! Runs a signaling server on an ephemeral loopback port and connects two
//! nodes to it, each with an in-memory sink:
//! - Directory membership
//! - Invite / accept / reject exchanges
//! - File transfers over loopback data connections
//!
//! # Example
//!
//! ```ignore
//! use lanbeam_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_transfer() {
//!     let fixture = TwoNodeFixture::new().await.unwrap();
//!     let path = fixture.write_file("notes.txt", 1024);
//!     let bob = fixture.bob_id().await;
//!     fixture.alice.send_files(&[path], &[bob]).await.unwrap();
//!     // ... test transfer ...
//!     fixture.cleanup().await;
//! }
//! ```

use lanbeam_core::{Node, NodeConfig, NodeEvent, NodeError, PeerId, SessionConfig};
use lanbeam_files::MemorySink;
use lanbeam_signal::{SignalServer, SignalServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// How long fixture helpers wait before giving up
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for the first event matching `pred`
///
/// Returns `None` on timeout or when the node's event stream closes.
/// Lagged receivers skip ahead.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<NodeEvent>,
    timeout: Duration,
    mut pred: F,
) -> Option<NodeEvent>
where
    F: FnMut(&NodeEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Two nodes sharing one signaling server
pub struct TwoNodeFixture {
    pub alice: Node,
    pub alice_events: broadcast::Receiver<NodeEvent>,
    pub alice_sink: MemorySink,
    pub bob: Node,
    pub bob_events: broadcast::Receiver<NodeEvent>,
    pub bob_sink: MemorySink,
    pub server_addr: SocketAddr,
    dir: TempDir,
    stop_server: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TwoNodeFixture {
    /// Create a fixture with plain in-memory sinks
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind or a node fails to start.
    pub async fn new() -> Result<Self, NodeError> {
        Self::with_bob_sink(MemorySink::new()).await
    }

    /// Create a fixture where bob writes into `bob_sink`
    ///
    /// Waits until both nodes see each other in the roster.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind or a node fails to start.
    pub async fn with_bob_sink(bob_sink: MemorySink) -> Result<Self, NodeError> {
        let server = SignalServer::bind(SignalServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        })
        .await?;
        let server_addr = server.local_addr()?;

        let (stop_server, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = server
                .run_until(async {
                    let _ = stopped.await;
                })
                .await;
        });

        let alice_sink = MemorySink::new();
        let (alice, alice_events) = Node::connect(
            node_config(server_addr, "Alice"),
            Arc::new(alice_sink.clone()),
        )?;
        let (bob, bob_events) =
            Node::connect(node_config(server_addr, "Bob"), Arc::new(bob_sink.clone()))?;

        let fixture = Self {
            alice,
            alice_events,
            alice_sink,
            bob,
            bob_events,
            bob_sink,
            server_addr,
            dir: tempfile::tempdir()?,
            stop_server: Some(stop_server),
            server,
        };
        fixture.wait_until_visible().await?;
        Ok(fixture)
    }

    async fn wait_until_visible(&self) -> Result<(), NodeError> {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if let (Some(a), Some(b)) = (self.alice.local_peer().await, self.bob.local_peer().await)
            {
                let alice_sees = self.alice.peers().await.iter().any(|p| p.id == b.id);
                let bob_sees = self.bob.peers().await.iter().any(|p| p.id == a.id);
                if alice_sees && bob_sees {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(NodeError::transport("nodes never saw each other"))
    }

    /// Alice's directory id
    pub async fn alice_id(&self) -> PeerId {
        self.alice.local_peer().await.map(|p| p.id).expect("alice registered")
    }

    /// Bob's directory id
    pub async fn bob_id(&self) -> PeerId {
        self.bob.local_peer().await.map(|p| p.id).expect("bob registered")
    }

    /// Write a file of `len` patterned bytes into the fixture directory
    pub fn write_file(&self, name: &str, len: usize) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, pattern(len)).unwrap_or_else(|e| panic!("write {name}: {e}"));
        path
    }

    /// Shut both nodes and the server down
    pub async fn cleanup(mut self) {
        self.alice.shutdown().await;
        self.bob.shutdown().await;
        if let Some(stop) = self.stop_server.take() {
            let _ = stop.send(());
        }
        let _ = self.server.await;
    }
}

/// Bytes written by [`TwoNodeFixture::write_file`]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn node_config(server: SocketAddr, label: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.signaling.server_url = format!("ws://{server}/ws");
    config.signaling.device_label = label.to_string();
    config.signaling.reconnect_delay = Duration::from_millis(100);
    config.session = SessionConfig::loopback();
    config
}
