//! Node implementation - high-level orchestrator
//!
//! The Node is the primary entry point for LANBEAM applications. It ties
//! the signaling client to sessions, the transfer scheduler and the receive
//! side, and keeps the task and incoming-transfer tables a UI renders.
//!
//! # Example
//!
//! ```no_run
//! use lanbeam_core::{Node, NodeConfig};
//! use lanbeam_files::DirectorySink;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let sink = Arc::new(DirectorySink::new("downloads"));
//!     let (node, mut events) = Node::connect(config, sink)?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::scheduler::{Job, TaskKey, TransferScheduler};
use crate::session_manager::{SessionEvent, SessionManager};
use crate::transfer::{
    FileInfo, IncomingStatus, IncomingTransfer, InvitePayload, TaskStatus, TransferTask,
    total_size_of,
};
use dashmap::DashMap;
use lanbeam_files::sender::percent;
use lanbeam_files::{
    ChannelMessage, FileSender, FlowController, ReceiveEvent, Reassembler, ReceiverSink,
};
use lanbeam_signal::{
    DirectoryUpdate, Forwarded, Peer, PeerId, ServerMessage, SignalClient, SignalEvent,
    SignalKind, SignalSender,
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the node event broadcast channel
const EVENT_CAPACITY: usize = 1024;

/// Notifications for a UI or CLI
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Signaling connection opened
    SignalingConnected,
    /// Signaling connection lost; reconnecting
    SignalingDisconnected,
    /// Own directory record
    LocalPeer(Peer),
    /// Roster changed; excludes self
    PeersChanged(Vec<Peer>),
    /// An outbound task changed
    TaskUpdated(TransferTask),
    /// An incoming transfer was created or changed
    IncomingUpdated(IncomingTransfer),
    /// An incoming transfer record was removed
    IncomingRemoved(String),
}

/// Instructions for a peer's receive pump
#[derive(Debug)]
enum ReceiverCommand {
    /// Abort the writers for these file ids
    Abort(Vec<String>),
}

/// Node inner state
pub(crate) struct NodeInner {
    /// Node configuration
    config: NodeConfig,
    /// Outbound signaling queue
    signals: SignalSender,
    /// Per-peer sessions
    sessions: SessionManager,
    /// Outbound send admission
    scheduler: TransferScheduler,
    /// Frames files onto channels
    sender: FileSender,
    /// Destination of received files
    sink: Arc<dyn ReceiverSink>,
    /// Own directory record
    local: RwLock<Option<Peer>>,
    /// Last roster, self included
    roster: RwLock<Vec<Peer>>,
    /// Outbound tasks in creation order
    tasks: RwLock<Vec<TransferTask>>,
    /// Incoming transfers in arrival order
    incoming: RwLock<Vec<IncomingTransfer>>,
    /// Live receive pumps (peer -> generation, command queue)
    receivers: DashMap<PeerId, (u64, mpsc::UnboundedSender<ReceiverCommand>)>,
    /// Receive pump generation counter
    next_pump: AtomicU64,
    /// Event fan-out
    events: broadcast::Sender<NodeEvent>,
    /// Signaling client, when the node owns one
    client: Mutex<Option<SignalClient>>,
    /// Event loop task
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// LANBEAM node
///
/// Cheap to clone; clones share state. Call [`Node::shutdown`] to close
/// sessions and stop background work.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("sessions", &self.inner.sessions.session_count())
            .finish_non_exhaustive()
    }
}

// ============ Constructors ============

impl Node {
    /// Create a node over an existing signaling connection
    ///
    /// # Arguments
    ///
    /// * `config` - Node configuration
    /// * `signals` - Outbound signaling queue
    /// * `signal_events` - Inbound signaling events
    /// * `sink` - Destination of received files
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] if the configuration is invalid.
    pub fn new(
        config: NodeConfig,
        signals: SignalSender,
        signal_events: mpsc::UnboundedReceiver<SignalEvent>,
        sink: Arc<dyn ReceiverSink>,
    ) -> Result<(Self, broadcast::Receiver<NodeEvent>)> {
        config.validate()?;

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let sessions = SessionManager::new(config.session.clone(), signals.clone(), session_tx);
        let scheduler = TransferScheduler::new(config.transfer.scheduler);
        let sender = FileSender::new(
            config.transfer.chunk_size,
            FlowController::new(config.transfer.high_water, config.transfer.low_water),
        );

        let node = Self {
            inner: Arc::new(NodeInner {
                config,
                signals,
                sessions,
                scheduler,
                sender,
                sink,
                local: RwLock::new(None),
                roster: RwLock::new(Vec::new()),
                tasks: RwLock::new(Vec::new()),
                incoming: RwLock::new(Vec::new()),
                receivers: DashMap::new(),
                next_pump: AtomicU64::new(0),
                events,
                client: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(run_events(
            Arc::downgrade(&node.inner),
            signal_events,
            session_rx,
        ));
        if let Ok(mut slot) = node.inner.event_loop.try_lock() {
            *slot = Some(handle);
        }

        tracing::info!("Node started");
        Ok((node, events_rx))
    }

    /// Create a node with its own signaling client
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the server URL
    /// cannot be parsed. Connection failures are retried in the background.
    pub fn connect(
        config: NodeConfig,
        sink: Arc<dyn ReceiverSink>,
    ) -> Result<(Self, broadcast::Receiver<NodeEvent>)> {
        config.validate()?;
        let (client, signals, signal_events) = SignalClient::connect(config.signal_client_config())?;
        let (node, events) = Self::new(config, signals, signal_events, sink)?;
        if let Ok(mut slot) = node.inner.client.try_lock() {
            *slot = Some(client);
        }
        Ok((node, events))
    }

    /// Close every session and stop background tasks
    ///
    /// Queued sends are dropped. Channels with no send in progress get up
    /// to the configured flush timeout to deliver what is already queued,
    /// so files reported as completed reach their peers whole.
    pub async fn shutdown(&self) {
        tracing::info!("Node shutting down");
        let dropped: HashSet<TaskKey> =
            self.inner.scheduler.cancel_all().await.into_iter().collect();
        if !dropped.is_empty() {
            self.update_tasks(|t| dropped.contains(&t.key()), TaskStatus::Error)
                .await;
        }

        let sending = self.sending_peers().await;
        self.inner
            .sessions
            .flush_channels(
                |peer| sending.contains(peer),
                self.inner.config.session.flush_timeout,
            )
            .await;
        self.inner.sessions.close_all();
        if let Some(client) = self.inner.client.lock().await.take() {
            client.shutdown().await;
        }
        if let Some(task) = self.inner.event_loop.lock().await.take() {
            task.abort();
        }
    }

    /// Drop the data connection to `peer`, keeping signaling up
    ///
    /// Running sends to the peer fail and transfers receiving from it are
    /// declined once the channel has drained. Returns whether a session
    /// existed.
    pub fn close_session(&self, peer: &PeerId) -> bool {
        self.inner.sessions.close_session(peer)
    }
}

// ============ Snapshots ============

impl Node {
    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Own directory record, once the server sent it
    pub async fn local_peer(&self) -> Option<Peer> {
        self.inner.local.read().await.clone()
    }

    /// Other peers on the roster
    pub async fn peers(&self) -> Vec<Peer> {
        let local = self.inner.local.read().await;
        let own_id = local.as_ref().map(|p| &p.id);
        self.inner
            .roster
            .read()
            .await
            .iter()
            .filter(|p| Some(&p.id) != own_id)
            .cloned()
            .collect()
    }

    /// Outbound tasks
    pub async fn tasks(&self) -> Vec<TransferTask> {
        self.inner.tasks.read().await.clone()
    }

    /// Incoming transfers
    pub async fn incoming(&self) -> Vec<IncomingTransfer> {
        self.inner.incoming.read().await.clone()
    }

    /// Whether the signaling connection is open
    pub fn is_connected(&self) -> bool {
        self.inner.signals.is_connected()
    }
}

// ============ Outbound ============

impl Node {
    /// Offer files to peers
    ///
    /// Every file gets one id shared by all recipients. Each peer receives
    /// one invite and one pending task per file.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if a recipient is not on the
    /// roster, or an I/O error if a path cannot be read. Nothing is sent on
    /// error.
    pub async fn send_files(
        &self,
        paths: &[PathBuf],
        peers: &[PeerId],
    ) -> Result<Vec<TransferTask>> {
        {
            let roster = self.inner.roster.read().await;
            if let Some(missing) = peers.iter().find(|id| !roster.iter().any(|p| &p.id == *id)) {
                return Err(NodeError::PeerNotFound(missing.clone()));
            }
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push((FileInfo::stat(path).await?, path.clone()));
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let invite = serde_json::to_value(InvitePayload {
            files: files.iter().map(|(f, _)| f.clone()).collect(),
        })?;

        let mut created = Vec::new();
        for peer in peers {
            let mut batch: Vec<TransferTask> = files
                .iter()
                .map(|(file, path)| TransferTask::new(file.clone(), path.clone(), peer.clone()))
                .collect();

            self.inner.tasks.write().await.extend(batch.iter().cloned());
            for task in &batch {
                self.emit(NodeEvent::TaskUpdated(task.clone()));
            }

            tracing::info!("Inviting {} to receive {} files", peer, batch.len());
            if !self
                .inner
                .signals
                .signal(SignalKind::Invite, peer, invite.clone())
            {
                tracing::warn!("Invite to {} not sent", peer);
                for task in &mut batch {
                    self.set_status(&task.key(), TaskStatus::Error).await;
                    task.status = TaskStatus::Error;
                }
            }
            created.extend(batch);
        }
        Ok(created)
    }

    async fn on_accept(&self, peer: &PeerId) {
        let started: Vec<TransferTask> = {
            let mut tasks = self.inner.tasks.write().await;
            tasks
                .iter_mut()
                .filter(|t| &t.target == peer && t.status == TaskStatus::Pending)
                .filter_map(|t| t.transition(TaskStatus::Transferring).then(|| t.clone()))
                .collect()
        };
        if started.is_empty() {
            tracing::debug!("Accept from {} with nothing pending", peer);
            return;
        }
        for task in &started {
            self.emit(NodeEvent::TaskUpdated(task.clone()));
        }
        tracing::info!("{} accepted {} files", peer, started.len());

        match self.inner.sessions.create_session(peer).await {
            Ok(()) | Err(NodeError::DuplicateSession(_)) => {}
            Err(e) => {
                tracing::warn!("Could not start session with {}: {}", peer, e);
                for task in &started {
                    self.set_status(&task.key(), TaskStatus::Error).await;
                }
                return;
            }
        }

        let jobs: Vec<(TaskKey, u64, Job)> = started
            .iter()
            .map(|task| {
                let key = task.key();
                let job: Job = Box::pin(self.clone().run_send(key.clone()));
                (key, task.file.size, job)
            })
            .collect();
        self.inner.scheduler.submit_all(jobs).await;
    }

    async fn on_reject(&self, peer: &PeerId) {
        let rejected = self
            .update_tasks(|t| &t.target == peer && t.status == TaskStatus::Pending, TaskStatus::Rejected)
            .await;
        tracing::info!("{} declined {} files", peer, rejected);
    }

    /// Body of one scheduled send
    async fn run_send(self, key: TaskKey) {
        let source = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .iter()
                .find(|t| t.key() == key && t.status == TaskStatus::Transferring)
                .map(|t| (t.file.metadata(), t.path.clone()))
        };
        let Some((meta, path)) = source else {
            tracing::debug!("Send {}/{} no longer wanted", key.peer, key.file_id);
            return;
        };

        let (progress_tx, mut progress_rx) = watch::channel(0.0f64);
        let updater = {
            let node = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                while progress_rx.changed().await.is_ok() {
                    let progress = *progress_rx.borrow_and_update();
                    node.set_progress(&key, progress).await;
                }
            })
        };

        let result = async {
            let channel = self.inner.sessions.wait_channel(&key.peer).await?;
            self.inner
                .sender
                .send_path(channel.as_ref(), &meta, &path, |sent, total| {
                    progress_tx.send_replace(percent(sent, total));
                })
                .await
                .map_err(NodeError::from)
        }
        .await;

        drop(progress_tx);
        let _ = updater.await;

        match result {
            Ok(bytes) => {
                tracing::info!("Sent {} ({} bytes) to {}", meta.name, bytes, key.peer);
                self.set_status(&key, TaskStatus::Completed).await;
            }
            Err(e) => {
                tracing::warn!("Sending {} to {} failed: {}", meta.name, key.peer, e);
                self.set_status(&key, TaskStatus::Error).await;
            }
        }
    }

    /// Peers a running send is still writing to
    async fn sending_peers(&self) -> HashSet<PeerId> {
        let running: HashSet<TaskKey> =
            self.inner.scheduler.running_keys().await.into_iter().collect();
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::Transferring && running.contains(&t.key()))
            .map(|t| t.target.clone())
            .collect()
    }

    async fn set_status(&self, key: &TaskKey, status: TaskStatus) {
        let updated = {
            let mut tasks = self.inner.tasks.write().await;
            tasks
                .iter_mut()
                .find(|t| &t.key() == key)
                .and_then(|t| t.transition(status).then(|| t.clone()))
        };
        if let Some(task) = updated {
            self.emit(NodeEvent::TaskUpdated(task));
        }
    }

    async fn set_progress(&self, key: &TaskKey, progress: f64) {
        let updated = {
            let mut tasks = self.inner.tasks.write().await;
            tasks
                .iter_mut()
                .find(|t| &t.key() == key && t.status == TaskStatus::Transferring)
                .map(|t| {
                    t.progress = progress;
                    t.clone()
                })
        };
        if let Some(task) = updated {
            self.emit(NodeEvent::TaskUpdated(task));
        }
    }

    /// Move every matching task to `status`; returns how many changed
    async fn update_tasks<F>(&self, matches: F, status: TaskStatus) -> usize
    where
        F: Fn(&TransferTask) -> bool,
    {
        let changed: Vec<TransferTask> = {
            let mut tasks = self.inner.tasks.write().await;
            tasks
                .iter_mut()
                .filter(|t| matches(t))
                .filter_map(|t| t.transition(status).then(|| t.clone()))
                .collect()
        };
        let count = changed.len();
        for task in changed {
            self.emit(NodeEvent::TaskUpdated(task));
        }
        count
    }
}

// ============ Inbound ============

impl Node {
    /// Accept a pending incoming transfer
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::TransferNotFound`] for an unknown id,
    /// [`NodeError::InvalidState`] if the transfer is not pending, or
    /// [`NodeError::Signaling`] if the answer could not be sent.
    pub async fn accept(&self, id: &str) -> Result<()> {
        let updated = {
            let mut incoming = self.inner.incoming.write().await;
            let transfer = incoming
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| NodeError::TransferNotFound(id.to_string()))?;

            if transfer.status != IncomingStatus::Pending {
                return Err(NodeError::invalid_state("transfer is not pending"));
            }
            if !self
                .inner
                .signals
                .signal(SignalKind::Accept, &transfer.sender, json!({}))
            {
                return Err(NodeError::Signaling("accept not sent".into()));
            }
            transfer.status = IncomingStatus::Receiving;
            transfer.clone()
        };

        tracing::info!("Accepted {} files from {}", updated.files.len(), updated.sender);
        self.emit(NodeEvent::IncomingUpdated(updated));
        Ok(())
    }

    /// Decline an incoming transfer and forget it
    ///
    /// A transfer that is not finished is rejected to the sender and any of
    /// its files being written are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::TransferNotFound`] for an unknown id.
    pub async fn decline(&self, id: &str) -> Result<()> {
        let removed = {
            let mut incoming = self.inner.incoming.write().await;
            let index = incoming
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| NodeError::TransferNotFound(id.to_string()))?;
            incoming.remove(index)
        };

        if !removed.status.is_terminal() {
            self.inner
                .signals
                .signal(SignalKind::Reject, &removed.sender, json!({}));
            self.abort_receiving(&removed);
        }

        tracing::info!("Declined transfer {} from {}", removed.id, removed.sender);
        self.emit(NodeEvent::IncomingRemoved(removed.id));
        Ok(())
    }

    async fn on_invite(&self, sender: &PeerId, payload: Value) {
        let invite: InvitePayload = match serde_json::from_value(payload) {
            Ok(invite) => invite,
            Err(e) => {
                tracing::warn!("Malformed invite from {}: {}", sender, e);
                return;
            }
        };
        if invite.files.is_empty() {
            return;
        }
        if total_size_of(&invite.files).is_none() {
            tracing::warn!("Invite from {} overflows the size total, ignoring", sender);
            return;
        }

        let (updated, merged_into_receiving) = {
            let mut incoming = self.inner.incoming.write().await;
            match incoming
                .iter_mut()
                .find(|t| &t.sender == sender && t.accepts_merge())
            {
                Some(existing) => {
                    if !existing.merge(invite.files) {
                        tracing::warn!(
                            "Invite from {} overflows transfer {}, ignoring",
                            sender,
                            existing.id
                        );
                        return;
                    }
                    (
                        existing.clone(),
                        existing.status == IncomingStatus::Receiving,
                    )
                }
                None => {
                    let transfer = IncomingTransfer::new(sender.clone(), invite.files);
                    incoming.push(transfer.clone());
                    (transfer, false)
                }
            }
        };

        tracing::info!(
            "Invite from {}: {} files, {} bytes",
            sender,
            updated.files.len(),
            updated.total_size
        );

        // Already accepted; the new files ride on that answer
        if merged_into_receiving {
            self.inner
                .signals
                .signal(SignalKind::Accept, sender, json!({}));
        }
        self.emit(NodeEvent::IncomingUpdated(updated));
    }

    fn abort_receiving(&self, transfer: &IncomingTransfer) {
        if let Some(pump) = self.inner.receivers.get(&transfer.sender) {
            let ids = transfer.files.iter().map(|f| f.id.clone()).collect();
            let _ = pump.1.send(ReceiverCommand::Abort(ids));
        }
    }

    fn start_receiver(&self, peer: PeerId, inbound: mpsc::UnboundedReceiver<ChannelMessage>) {
        let generation = self.inner.next_pump.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        self.inner
            .receivers
            .insert(peer.clone(), (generation, commands_tx));
        tokio::spawn(self.clone().receive_pump(peer, generation, inbound, commands));
    }

    async fn receive_pump(
        self,
        peer: PeerId,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<ChannelMessage>,
        mut commands: mpsc::UnboundedReceiver<ReceiverCommand>,
    ) {
        let mut reassembler = Reassembler::new(self.inner.sink.clone());
        let mut commands_open = true;

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        if let Some(event) = reassembler.handle(&msg).await {
                            self.on_receive(&peer, event, &mut reassembler).await;
                        }
                    }
                    None => break,
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(ReceiverCommand::Abort(ids)) => {
                        for id in ids {
                            reassembler.abort(&id).await;
                        }
                    }
                    None => commands_open = false,
                },
            }
        }

        // Every message the channel delivered has been handled by now
        let aborted = reassembler.abort_all().await;
        if !aborted.is_empty() {
            tracing::info!("Channel to {} closed with {} files unfinished", peer, aborted.len());
        }
        let current = self
            .inner
            .receivers
            .remove_if(&peer, |_, (g, _)| *g == generation)
            .is_some();
        if current {
            self.decline_receiving(&peer).await;
        }
    }

    /// Mark transfers still receiving from `peer` as declined
    async fn decline_receiving(&self, peer: &PeerId) {
        let declined: Vec<IncomingTransfer> = {
            let mut incoming = self.inner.incoming.write().await;
            incoming
                .iter_mut()
                .filter(|t| &t.sender == peer && t.status == IncomingStatus::Receiving)
                .map(|t| {
                    t.status = IncomingStatus::Declined;
                    t.clone()
                })
                .collect()
        };
        for transfer in declined {
            tracing::info!("Transfer {} from {} ended unfinished", transfer.id, peer);
            self.emit(NodeEvent::IncomingUpdated(transfer));
        }
    }

    async fn on_receive(&self, peer: &PeerId, event: ReceiveEvent, reassembler: &mut Reassembler) {
        let file_id = match &event {
            ReceiveEvent::Started { id, .. }
            | ReceiveEvent::Progress { id, .. }
            | ReceiveEvent::Completed { id, .. }
            | ReceiveEvent::Failed { id, .. } => id.clone(),
        };

        let mut abort = Vec::new();
        let updated = {
            let mut incoming = self.inner.incoming.write().await;
            let transfer = incoming.iter_mut().find(|t| {
                &t.sender == peer
                    && t.status == IncomingStatus::Receiving
                    && t.contains(&file_id)
            });

            match (transfer, event) {
                (None, ReceiveEvent::Started { id, name, .. }) => {
                    tracing::warn!("Unexpected file {} ({}) from {}, discarding", id, name, peer);
                    abort.push(id);
                    None
                }
                (None, _) => None,
                (Some(t), ReceiveEvent::Started { id, .. }) => {
                    t.record(&id, 0);
                    Some(t.clone())
                }
                (Some(t), ReceiveEvent::Progress { id, received, .. }) => {
                    t.record(&id, received);
                    Some(t.clone())
                }
                (Some(t), ReceiveEvent::Completed { id, received }) => {
                    if t.complete_file(&id, received) {
                        tracing::info!("Received all {} files from {}", t.files.len(), peer);
                    }
                    Some(t.clone())
                }
                (Some(t), ReceiveEvent::Failed { id, error }) => {
                    tracing::warn!("Receiving {} from {} failed: {}", id, peer, error);
                    t.status = IncomingStatus::Declined;
                    abort.extend(t.files.iter().map(|f| f.id.clone()));
                    Some(t.clone())
                }
            }
        };

        for id in abort {
            reassembler.abort(&id).await;
        }
        if let Some(transfer) = updated {
            self.emit(NodeEvent::IncomingUpdated(transfer));
        }
    }
}

// ============ Event handling ============

impl Node {
    async fn on_signal_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::Connected => self.emit(NodeEvent::SignalingConnected),
            SignalEvent::Disconnected => self.emit(NodeEvent::SignalingDisconnected),
            SignalEvent::Message(ServerMessage::Directory(DirectoryUpdate::UserInfo { data })) => {
                tracing::info!("Registered as {} ({})", data.display_name, data.id);
                *self.inner.local.write().await = Some(data.clone());
                self.emit(NodeEvent::LocalPeer(data));
            }
            SignalEvent::Message(ServerMessage::Directory(DirectoryUpdate::UserList { data })) => {
                self.on_roster(data).await;
            }
            SignalEvent::Message(ServerMessage::Signal(forwarded)) => {
                self.on_forwarded(forwarded).await;
            }
        }
    }

    async fn on_forwarded(&self, msg: Forwarded) {
        let known = self
            .inner
            .roster
            .read()
            .await
            .iter()
            .any(|p| p.id == msg.sender);
        if !known {
            tracing::debug!("Ignoring {} from unknown peer {}", msg.kind, msg.sender);
            return;
        }

        match msg.kind {
            SignalKind::Invite => self.on_invite(&msg.sender, msg.payload).await,
            SignalKind::Accept => self.on_accept(&msg.sender).await,
            SignalKind::Reject => self.on_reject(&msg.sender).await,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
                if let Err(e) = self
                    .inner
                    .sessions
                    .handle_signal(msg.kind, &msg.sender, msg.payload)
                {
                    tracing::warn!("{} from {} not applied: {}", msg.kind, msg.sender, e);
                }
            }
        }
    }

    async fn on_roster(&self, list: Vec<Peer>) {
        let present: HashSet<PeerId> = list.iter().map(|p| p.id.clone()).collect();
        *self.inner.roster.write().await = list;

        let vanished = self
            .update_tasks(
                |t| t.status == TaskStatus::Pending && !present.contains(&t.target),
                TaskStatus::Rejected,
            )
            .await;
        if vanished > 0 {
            tracing::info!("{} pending sends dropped with their peers", vanished);
        }

        let removed: Vec<IncomingTransfer> = {
            let mut incoming = self.inner.incoming.write().await;
            let (gone, kept) = std::mem::take(&mut *incoming)
                .into_iter()
                .partition(|t| !present.contains(&t.sender));
            *incoming = kept;
            gone
        };
        // Files already streaming finish or fail with their data channel
        for transfer in removed {
            self.emit(NodeEvent::IncomingRemoved(transfer.id));
        }

        self.emit(NodeEvent::PeersChanged(self.peers().await));
    }

    async fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ChannelOpen { peer, inbound, .. } => {
                tracing::debug!("Data channel with {} ready", peer);
                self.start_receiver(peer, inbound);
            }
            SessionEvent::StateChanged { peer, state } if state.is_terminal() => {
                tracing::info!("Session with {} ended ({:?})", peer, state);
                self.update_tasks(
                    |t| t.target == peer && t.status == TaskStatus::Transferring,
                    TaskStatus::Error,
                )
                .await;
                self.inner.scheduler.cancel_peer(&peer).await;

                // A live receive pump drains the channel first and declines on exit
                if !self.inner.receivers.contains_key(&peer) {
                    self.decline_receiving(&peer).await;
                }
            }
            SessionEvent::StateChanged { peer, state } => {
                tracing::debug!("Session with {}: {:?}", peer, state);
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Dispatch signaling and session events until the node is dropped
async fn run_events(
    node: Weak<NodeInner>,
    mut signal_events: mpsc::UnboundedReceiver<SignalEvent>,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let mut signals_open = true;

    loop {
        tokio::select! {
            event = signal_events.recv(), if signals_open => match event {
                Some(event) => {
                    let Some(inner) = node.upgrade() else { break };
                    Node { inner }.on_signal_event(event).await;
                }
                None => {
                    tracing::debug!("Signaling event stream ended");
                    signals_open = false;
                }
            },
            event = session_events.recv() => match event {
                Some(event) => {
                    let Some(inner) = node.upgrade() else { break };
                    Node { inner }.on_session_event(event).await;
                }
                None => break,
            },
        }
    }
}
