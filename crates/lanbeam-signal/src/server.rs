//! WebSocket signaling server.
//!
//! Each accepted connection is registered in the directory, receives its own
//! record as `user-info`, and triggers a roster broadcast. Text frames from
//! the client are parsed as addressed signals and handed to the router. On
//! disconnect the peer is unregistered and the roster is broadcast again.

use crate::directory::DirectoryService;
use crate::error::Result;
use crate::protocol::{ClientMessage, DirectoryUpdate, ServerMessage};
use crate::router::SignalingRouter;
use crate::{DEFAULT_PORT, UNKNOWN_DEVICE};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Signaling server configuration
#[derive(Debug, Clone)]
pub struct SignalServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
}

impl Default for SignalServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
        }
    }
}

/// Signaling server hosting the directory and router
pub struct SignalServer {
    /// Bound listener
    listener: TcpListener,
    /// Router over the shared directory
    router: SignalingRouter,
}

impl SignalServer {
    /// Bind the server
    ///
    /// # Errors
    ///
    /// Returns error if the listen address cannot be bound.
    pub async fn bind(config: SignalServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let directory = Arc::new(DirectoryService::new());
        tracing::info!("Signaling server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            router: SignalingRouter::new(directory),
        })
    }

    /// Address the server is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared peer directory
    pub fn directory(&self) -> Arc<DirectoryService> {
        self.router.directory().clone()
    }

    /// Accept connections forever
    ///
    /// # Errors
    ///
    /// Never returns under normal operation.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Accept failures are logged and do not stop the server.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Signaling server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let router = self.router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(router, stream, addr).await {
                                tracing::debug!("Connection from {} ended with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },
            }
        }
    }
}

/// Path and query captured during the WebSocket handshake
#[derive(Debug, Default)]
struct Upgrade {
    path: String,
    query: Option<String>,
}

impl Upgrade {
    fn path_allowed(&self) -> bool {
        matches!(self.path.as_str(), "/ws" | "/")
    }

    fn device_label(&self) -> String {
        self.query
            .as_deref()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(key, _)| key == "deviceName")
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string())
    }
}

async fn handle_connection(
    router: SignalingRouter,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let mut upgrade = Upgrade::default();
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        upgrade.path = req.uri().path().to_string();
        upgrade.query = req.uri().query().map(str::to_string);
        Ok(resp)
    };
    let mut ws = accept_hdr_async(stream, callback).await?;

    if !upgrade.path_allowed() {
        tracing::warn!("Rejecting {}: invalid path {}", addr, upgrade.path);
        ws.close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "Invalid path".into(),
        }))
        .await?;
        return Ok(());
    }

    let directory = router.directory().clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let peer = directory
        .register(tx.clone(), &upgrade.device_label(), Some(addr.ip().to_string()))
        .await;

    // Own record first so the client knows its id before the roster arrives
    let _ = tx.send(DirectoryUpdate::UserInfo { data: peer.clone() }.into());
    drop(tx);
    router.broadcast_roster().await;

    let (mut sink, mut incoming) = ws.split();

    let peer_id = peer.id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to encode message for {}: {}", peer_id, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = incoming.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    router.route(&peer.id, msg).await;
                }
                Err(e) => tracing::warn!("Malformed message from {}: {}", peer.id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Read error from {}: {}", peer.id, e);
                break;
            }
        }
    }

    // Dropping the directory's queue handle ends the writer task
    directory.unregister(&peer.id).await;
    router.broadcast_roster().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_paths() {
        let mut up = Upgrade::default();
        for (path, ok) in [("/ws", true), ("/", true), ("/api", false), ("/ws/x", false)] {
            up.path = path.to_string();
            assert_eq!(up.path_allowed(), ok, "path {path}");
        }
    }

    #[test]
    fn test_device_label_from_query() {
        let up = Upgrade {
            path: "/ws".into(),
            query: Some("deviceName=Mac%20Studio&x=1".into()),
        };
        assert_eq!(up.device_label(), "Mac Studio");
    }

    #[test]
    fn test_device_label_default() {
        let up = Upgrade::default();
        assert_eq!(up.device_label(), UNKNOWN_DEVICE);

        let blank = Upgrade {
            path: "/".into(),
            query: Some("deviceName=".into()),
        };
        assert_eq!(blank.device_label(), UNKNOWN_DEVICE);
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let server = SignalServer::bind(SignalServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.directory().is_empty().await);
    }
}
