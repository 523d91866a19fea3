//! Session management for LANBEAM nodes
//!
//! This module provides per-peer session lifecycle management:
//! - Offer/answer negotiation relayed through the signaling server
//! - Candidate exchange and data connection establishment
//! - Data channel hand-off to the session owner
//! - Teardown when the channel reaches a terminal state
//!
//! # Architecture
//!
//! Sessions are stored in a concurrent DashMap keyed by peer id. Insertion
//! goes through the entry API, so concurrent attempts to create a session
//! for the same peer have exactly one winner.
//!
//! # Negotiation Flow
//!
//! ```text
//! Offerer                                    Answerer
//!    |  bind listener                            |
//!    |------ offer {sessionId} ----------------->|
//!    |------ ice-candidate {ip:port} ----------->|
//!    |<----- answer {sessionId} -----------------|
//!    |                                           |  dial candidate
//!    |<===== TCP connect + hello {sessionId} ====|
//!    |                                           |
//!    |          [Data channel open]              |
//! ```

use crate::channel::{ChannelState, DataChannel, read_message, write_message};
use crate::config::SessionConfig;
use crate::error::{NodeError, Result};
use crate::session::{
    ChannelHello, ConnectionState, IceCandidate, Role, SdpKind, Session, SessionDescription,
    SessionState, new_session_id,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lanbeam_files::{ChannelMessage, FrameChannel};
use lanbeam_signal::{PeerId, SignalKind, SignalSender};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Largest hello message accepted
const MAX_HELLO_SIZE: usize = 1024;

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Notifications from the session manager
#[derive(Debug)]
pub enum SessionEvent {
    /// A session's data channel opened
    ChannelOpen {
        /// Remote peer
        peer: PeerId,
        /// The channel
        channel: Arc<DataChannel>,
        /// Inbound messages; ends when the channel closes
        inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    },
    /// Transport state of a session changed
    StateChanged {
        /// Remote peer
        peer: PeerId,
        /// New state
        state: ConnectionState,
    },
}

struct Inner {
    config: SessionConfig,
    sessions: DashMap<PeerId, Session>,
    signals: SignalSender,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Session manager for LANBEAM nodes
///
/// Cheap to clone; clones share the session table.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a session manager
    ///
    /// # Arguments
    ///
    /// * `config` - Listener and dialing settings
    /// * `signals` - Outbound signaling queue for offers, answers and candidates
    /// * `events` - Receives [`SessionEvent`]s
    pub fn new(
        config: SessionConfig,
        signals: SignalSender,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: DashMap::new(),
                signals,
                events,
            }),
        }
    }

    /// Negotiation state of the session with `peer`
    pub fn state(&self, peer: &PeerId) -> Option<SessionState> {
        self.inner.sessions.get(peer).map(|s| s.state)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Start a session with `peer` as the offerer
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::DuplicateSession`] if any session with the peer
    /// exists; the existing session is left untouched. Returns an I/O error
    /// if the data listener cannot be bound.
    pub async fn create_session(&self, peer: &PeerId) -> Result<()> {
        if self.inner.sessions.contains_key(peer) {
            tracing::warn!("Session with {} already exists, not creating another", peer);
            return Err(NodeError::DuplicateSession(peer.clone()));
        }

        let listener = TcpListener::bind((self.inner.config.bind_ip, 0)).await?;
        let local = listener.local_addr()?;
        let session_id = new_session_id();

        match self.inner.sessions.entry(peer.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!("Session with {} already exists, not creating another", peer);
                return Err(NodeError::DuplicateSession(peer.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Session::new(session_id.clone(), Role::Offerer));
            }
        }

        let task = tokio::spawn(
            self.clone()
                .accept_loop(peer.clone(), session_id.clone(), listener),
        );
        self.track(peer, &session_id, task);

        tracing::info!("Offering session {} to {} (listening on {})", session_id, peer, local);
        self.emit_state(peer, ConnectionState::Connecting);

        self.signal(
            SignalKind::Offer,
            peer,
            serde_json::to_value(SessionDescription::offer(&session_id))?,
        );
        for addr in local_candidates(&self.inner.config, local) {
            let candidate = IceCandidate {
                session_id: session_id.clone(),
                candidate: addr.to_string(),
            };
            self.signal(SignalKind::IceCandidate, peer, serde_json::to_value(candidate)?);
        }

        Ok(())
    }

    /// Answer an offer from `peer`
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::DuplicateSession`] if a session with the peer
    /// exists, or [`NodeError::Negotiation`] if the payload is not an offer.
    pub fn handle_offer(&self, peer: &PeerId, offer: SessionDescription) -> Result<()> {
        if offer.kind != SdpKind::Offer {
            return Err(NodeError::negotiation("expected an offer"));
        }

        match self.inner.sessions.entry(peer.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!("Ignoring offer from {}: session already exists", peer);
                return Err(NodeError::DuplicateSession(peer.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Session::new(offer.session_id.clone(), Role::Answerer));
            }
        }

        tracing::info!("Answering session {} from {}", offer.session_id, peer);
        self.emit_state(peer, ConnectionState::Connecting);
        self.signal(
            SignalKind::Answer,
            peer,
            serde_json::to_value(SessionDescription::answer(offer.session_id))?,
        );
        Ok(())
    }

    /// Apply the answer to our offer
    ///
    /// # Errors
    ///
    /// Returns error if there is no session, it is not ours to answer, or the
    /// session id does not match. Nothing is mutated on error.
    pub fn handle_answer(&self, peer: &PeerId, answer: SessionDescription) -> Result<()> {
        let mut session = self
            .inner
            .sessions
            .get_mut(peer)
            .ok_or_else(|| NodeError::SessionNotFound(peer.clone()))?;

        if answer.kind != SdpKind::Answer
            || session.role != Role::Offerer
            || session.session_id != answer.session_id
        {
            tracing::warn!("Ignoring unexpected answer from {}", peer);
            return Err(NodeError::negotiation("answer does not match session"));
        }

        session.answered = true;
        tracing::debug!("Session {} with {} answered", session.session_id, peer);
        Ok(())
    }

    /// Apply a remote candidate
    ///
    /// On the answering side each candidate is dialed; the first connection
    /// that completes the hello becomes the data channel.
    ///
    /// # Errors
    ///
    /// Returns error if there is no session, the session id does not match,
    /// or the address is malformed.
    pub fn handle_candidate(&self, peer: &PeerId, candidate: IceCandidate) -> Result<()> {
        let addr = candidate.addr()?;
        let mut session = self
            .inner
            .sessions
            .get_mut(peer)
            .ok_or_else(|| NodeError::SessionNotFound(peer.clone()))?;

        if session.session_id != candidate.session_id {
            tracing::warn!("Ignoring candidate for stale session from {}", peer);
            return Err(NodeError::negotiation("candidate for unknown session"));
        }

        session.remote_candidates.push(addr);

        if session.role == Role::Answerer && session.state == SessionState::Negotiating {
            tracing::debug!("Dialing candidate {} for {}", addr, peer);
            let task = tokio::spawn(self.clone().dial(
                peer.clone(),
                session.session_id.clone(),
                addr,
            ));
            session.tasks.push(task);
        }
        Ok(())
    }

    /// Dispatch a negotiation signal by kind
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be parsed or the handler rejects it.
    pub fn handle_signal(&self, kind: SignalKind, peer: &PeerId, payload: Value) -> Result<()> {
        match kind {
            SignalKind::Offer => self.handle_offer(peer, serde_json::from_value(payload)?),
            SignalKind::Answer => self.handle_answer(peer, serde_json::from_value(payload)?),
            SignalKind::IceCandidate => {
                self.handle_candidate(peer, serde_json::from_value(payload)?)
            }
            other => Err(NodeError::Negotiation(
                format!("{other} is not a negotiation signal").into(),
            )),
        }
    }

    /// Wait for the data channel of the session with `peer`
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SessionNotFound`] if there is no session, or a
    /// transport error if the session ends before its channel opens.
    pub async fn wait_channel(&self, peer: &PeerId) -> Result<Arc<DataChannel>> {
        let mut slot = {
            let session = self
                .inner
                .sessions
                .get(peer)
                .ok_or_else(|| NodeError::SessionNotFound(peer.clone()))?;
            session.channel.subscribe()
        };

        let channel = slot
            .wait_for(Option::is_some)
            .await
            .map_err(|_| NodeError::transport("session closed before its channel opened"))?
            .clone();
        channel.ok_or_else(|| NodeError::transport("session closed before its channel opened"))
    }

    /// Close the session with `peer`
    pub fn close_session(&self, peer: &PeerId) -> bool {
        match self.inner.sessions.remove(peer) {
            Some((_, session)) => {
                tracing::info!("Closed session {} with {}", session.session_id, peer);
                drop(session);
                self.emit_state(peer, ConnectionState::Closed);
                true
            }
            None => false,
        }
    }

    /// Wait for queued data on open channels to reach the network
    ///
    /// Channels to peers for which `skip` returns `true` are not waited on.
    /// Gives up once `limit` has passed in total.
    pub async fn flush_channels<F>(&self, skip: F, limit: Duration)
    where
        F: Fn(&PeerId) -> bool,
    {
        let channels: Vec<(PeerId, Arc<DataChannel>)> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| !skip(entry.key()))
            .filter_map(|entry| {
                let channel = entry.value().channel.borrow().clone();
                channel.map(|channel| (entry.key().clone(), channel))
            })
            .collect();

        let deadline = tokio::time::Instant::now() + limit;
        for (peer, channel) in channels {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !channel.flush(remaining).await && channel.is_open() {
                tracing::warn!(
                    "Data channel to {} not flushed, dropping {} queued bytes",
                    peer,
                    channel.buffered_amount()
                );
            }
        }
    }

    /// Close every session
    pub fn close_all(&self) {
        let peers: Vec<PeerId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for peer in peers {
            self.close_session(&peer);
        }
    }

    fn signal(&self, kind: SignalKind, peer: &PeerId, payload: Value) {
        if !self.inner.signals.signal(kind, peer, payload) {
            tracing::warn!("Could not send {} to {}", kind, peer);
        }
    }

    fn emit_state(&self, peer: &PeerId, state: ConnectionState) {
        let _ = self.inner.events.send(SessionEvent::StateChanged {
            peer: peer.clone(),
            state,
        });
    }

    /// Attach a task to a live session, or stop it if the session is gone
    fn track(&self, peer: &PeerId, session_id: &str, task: tokio::task::JoinHandle<()>) {
        match self.inner.sessions.get_mut(peer) {
            Some(mut session) if session.session_id == session_id => session.tasks.push(task),
            _ => task.abort(),
        }
    }

    async fn accept_loop(self, peer: PeerId, session_id: String, listener: TcpListener) {
        loop {
            let (mut stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Data listener for {} failed: {}", peer, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let hello = tokio::time::timeout(
                self.inner.config.hello_timeout,
                read_message(&mut stream, MAX_HELLO_SIZE),
            )
            .await;

            let matches = match hello {
                Ok(Ok(Some(ChannelMessage::Text(text)))) => {
                    serde_json::from_str::<ChannelHello>(&text)
                        .map(|h| h.session_id == session_id)
                        .unwrap_or(false)
                }
                _ => false,
            };

            if matches {
                tracing::debug!("Accepted data connection from {} for {}", addr, peer);
                self.attach(&peer, &session_id, stream);
                return;
            }
            tracing::debug!("Rejected data connection from {}", addr);
        }
    }

    async fn dial(self, peer: PeerId, session_id: String, addr: SocketAddr) {
        let connect = tokio::time::timeout(
            self.inner.config.connect_timeout,
            TcpStream::connect(addr),
        )
        .await;

        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("Candidate {} for {} unreachable: {}", addr, peer, e);
                return;
            }
            Err(_) => {
                tracing::debug!("Candidate {} for {} timed out", addr, peer);
                return;
            }
        };

        let hello = ChannelHello {
            session_id: session_id.clone(),
        };
        let Ok(text) = serde_json::to_string(&hello) else {
            return;
        };
        if let Err(e) = write_message(&mut stream, &ChannelMessage::Text(text)).await {
            tracing::debug!("Hello to {} failed: {}", addr, e);
            return;
        }

        self.attach(&peer, &session_id, stream);
    }

    /// Promote a connected stream to the session's data channel
    fn attach(&self, peer: &PeerId, session_id: &str, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        // Answerer session ids come from the remote peer; cut on characters
        let short: String = session_id.chars().take(8).collect();
        let label = format!("{peer}/{short}");
        let (channel, inbound) =
            DataChannel::open(stream, label, self.inner.config.max_message_size);

        {
            let Some(mut session) = self.inner.sessions.get_mut(peer) else {
                channel.close();
                return;
            };
            if session.session_id != session_id || session.state != SessionState::Negotiating {
                // Lost the race to another candidate
                channel.close();
                return;
            }
            session.state = SessionState::Open;
            session.channel.send_replace(Some(channel.clone()));
        }

        tracing::info!("Session with {} open", peer);
        self.emit_state(peer, ConnectionState::Connected);
        let _ = self.inner.events.send(SessionEvent::ChannelOpen {
            peer: peer.clone(),
            channel: channel.clone(),
            inbound,
        });

        let this = self.clone();
        let peer = peer.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let state = channel.closed().await;
            this.teardown(&peer, &session_id, state);
        });
    }

    fn teardown(&self, peer: &PeerId, session_id: &str, state: ChannelState) {
        let removed = self
            .inner
            .sessions
            .remove_if(peer, |_, session| session.session_id == session_id);

        if removed.is_some() {
            let state = ConnectionState::from(state);
            tracing::info!("Session with {} ended: {:?}", peer, state);
            self.emit_state(peer, state);
        }
    }
}

/// Addresses to advertise for a listener bound at `local`
fn local_candidates(config: &SessionConfig, local: SocketAddr) -> Vec<SocketAddr> {
    let port = local.port();
    if !config.advertise_ips.is_empty() {
        return config
            .advertise_ips
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();
    }
    if !local.ip().is_unspecified() {
        return vec![local];
    }

    let mut ips = Vec::new();
    if let Some(ip) = primary_ip() {
        ips.push(ip);
    }
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    if !ips.contains(&loopback) {
        ips.push(loopback);
    }
    ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect()
}

/// Address of the interface holding the default route
///
/// Connecting a UDP socket selects a route without sending anything.
fn primary_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
