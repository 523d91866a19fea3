//! Reconnecting signaling client.
//!
//! A background task owns the WebSocket. Outbound signals are queued through
//! a [`SignalSender`]; inbound server messages and connection state changes
//! arrive as [`SignalEvent`]s. After an abnormal close the task waits for the
//! configured delay and reconnects; a normal close (code 1000) or dropping the
//! [`SignalClient`] stops it.

use crate::UNKNOWN_DEVICE;
use crate::error::Result;
use crate::protocol::{ClientMessage, PeerId, ServerMessage, SignalKind};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalClientConfig {
    /// Server endpoint, e.g. `ws://192.168.1.2:4927/ws`
    pub server_url: String,
    /// Device label announced to other peers
    pub device_label: String,
    /// Delay before reconnecting after an abnormal close
    pub reconnect_delay: Duration,
}

impl Default for SignalClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}/ws", crate::DEFAULT_PORT),
            device_label: UNKNOWN_DEVICE.to_string(),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl SignalClientConfig {
    /// Full connection URL including the device label query
    ///
    /// # Errors
    ///
    /// Returns [`crate::SignalError::InvalidUrl`] if `server_url` is not a valid URL.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)?;
        url.query_pairs_mut()
            .append_pair("deviceName", &self.device_label);
        Ok(url)
    }
}

/// Events emitted by the client task
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// WebSocket opened
    Connected,
    /// WebSocket closed; a reconnect may follow
    Disconnected,
    /// Message from the server
    Message(ServerMessage),
}

/// Handle for queueing outbound signals
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
}

impl SignalSender {
    /// Sender not backed by a socket; messages land in the returned receiver
    ///
    /// Used to wire components together in-process.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                connected: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Whether the underlying connection is open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a message
    ///
    /// Returns `false` and drops the message if the connection is not open.
    pub fn send(&self, msg: ClientMessage) -> bool {
        if !self.is_connected() {
            tracing::warn!("Signaling not connected, dropping {} to {}", msg.kind, msg.target);
            return false;
        }
        self.tx.send(msg).is_ok()
    }

    /// Queue a signal of `kind` for `target`
    pub fn signal(&self, kind: SignalKind, target: &PeerId, payload: Value) -> bool {
        self.send(ClientMessage::new(kind, target.clone(), payload))
    }
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// Local shutdown or all handles dropped
    Shutdown,
    /// Server closed with code 1000
    Normal,
    /// Anything else; reconnect
    Abnormal,
}

/// Running signaling client
///
/// Dropping the client stops the background task.
pub struct SignalClient {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SignalClient {
    /// Start the client task
    ///
    /// # Errors
    ///
    /// Returns [`crate::SignalError::InvalidUrl`] if the server URL cannot be parsed.
    /// Connection failures are not errors; they are retried in the background.
    pub fn connect(
        config: SignalClientConfig,
    ) -> Result<(Self, SignalSender, mpsc::UnboundedReceiver<SignalEvent>)> {
        let endpoint = config.endpoint()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let sender = SignalSender {
            tx: out_tx,
            connected: connected.clone(),
        };

        let task = tokio::spawn(run_client(
            endpoint,
            config.reconnect_delay,
            connected,
            out_rx,
            event_tx,
            shutdown_rx,
        ));

        Ok((Self { shutdown, task }, sender, event_rx))
    }

    /// Close the connection normally and stop reconnecting
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_client(
    endpoint: Url,
    reconnect_delay: Duration,
    connected: Arc<AtomicBool>,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<SignalEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tracing::debug!("Connecting to signaling server {}", endpoint);

        let ended = match connect_async(endpoint.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!("Connected to signaling server {}", endpoint);
                connected.store(true, Ordering::Release);
                let _ = events.send(SignalEvent::Connected);

                let ended = run_connection(ws, &mut out_rx, &events, &mut shutdown).await;

                connected.store(false, Ordering::Release);
                while let Ok(stale) = out_rx.try_recv() {
                    tracing::warn!("Dropping unsent {} to {}", stale.kind, stale.target);
                }
                let _ = events.send(SignalEvent::Disconnected);
                ended
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", endpoint, e);
                Ended::Abnormal
            }
        };

        if ended != Ended::Abnormal || events.is_closed() {
            tracing::info!("Signaling client stopped");
            return;
        }

        tracing::info!("Reconnecting in {:?}", reconnect_delay);
        tokio::select! {
            () = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_connection(
    ws: WsStream,
    out_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<SignalEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                return Ended::Shutdown;
            }
            outbound = out_rx.recv() => {
                let Some(msg) = outbound else {
                    let _ = sink.close().await;
                    return Ended::Shutdown;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode {}: {}", msg.kind, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!("Signaling send failed: {}", e);
                    return Ended::Abnormal;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                    Ok(msg) => {
                        if events.send(SignalEvent::Message(msg)).is_err() {
                            return Ended::Shutdown;
                        }
                    }
                    Err(e) => tracing::warn!("Malformed server message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| f.code);
                    tracing::info!("Signaling server closed connection: {:?}", code);
                    return if code == Some(CloseCode::Normal) {
                        Ended::Normal
                    } else {
                        Ended::Abnormal
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Signaling connection error: {}", e);
                    return Ended::Abnormal;
                }
                None => return Ended::Abnormal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;
    use serde_json::json;

    #[test]
    fn test_endpoint_adds_device_name() {
        let config = SignalClientConfig {
            server_url: "ws://10.0.0.1:4927/ws".into(),
            device_label: "Mac Mini".into(),
            ..Default::default()
        };
        let url = config.endpoint().unwrap();
        assert_eq!(url.path(), "/ws");
        assert_eq!(url.query(), Some("deviceName=Mac+Mini"));
    }

    #[test]
    fn test_endpoint_invalid() {
        let config = SignalClientConfig {
            server_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(config.endpoint(), Err(SignalError::InvalidUrl(_))));
    }

    #[test]
    fn test_channel_sender_delivers() {
        let (sender, mut rx) = SignalSender::channel();
        assert!(sender.signal(SignalKind::Accept, &PeerId::from("p1"), json!({})));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.kind, SignalKind::Accept);
        assert_eq!(msg.target.as_str(), "p1");
    }

    #[test]
    fn test_send_while_disconnected_dropped() {
        let (sender, mut rx) = SignalSender::channel();
        sender.connected.store(false, Ordering::Release);
        assert!(!sender.signal(SignalKind::Invite, &PeerId::from("p1"), json!({})));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_nothing_until_shutdown() {
        let config = SignalClientConfig {
            server_url: "ws://127.0.0.1:1/ws".into(),
            reconnect_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let (client, sender, mut events) = SignalClient::connect(config).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sender.is_connected());
        assert!(events.try_recv().is_err());
        client.shutdown().await;
    }
}
