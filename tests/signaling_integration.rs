//! Signaling server tests over real WebSocket connections.
//!
//! Each test binds a server on an ephemeral loopback port and talks to it
//! with raw WebSocket clients, so the JSON wire format is exercised exactly
//! as other implementations would see it.

use futures_util::{SinkExt, StreamExt};
use lanbeam_signal::{
    DirectoryUpdate, Forwarded, Peer, PeerId, ServerMessage, SignalClient, SignalClientConfig,
    SignalEvent, SignalKind, SignalServer, SignalServerConfig, UNKNOWN_DEVICE,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, oneshot::Sender<()>) {
    let server = SignalServer::bind(SignalServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    (addr, stop)
}

async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
    ws
}

async fn next_message(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::from_json(&text).unwrap();
        }
    }
}

async fn user_info(ws: &mut Ws) -> Peer {
    match next_message(ws).await {
        ServerMessage::Directory(DirectoryUpdate::UserInfo { data }) => data,
        other => panic!("expected user-info, got {other:?}"),
    }
}

/// Next roster, skipping anything else
async fn next_roster(ws: &mut Ws) -> Vec<Peer> {
    loop {
        if let ServerMessage::Directory(DirectoryUpdate::UserList { data }) = next_message(ws).await
        {
            return data;
        }
    }
}

/// Skip rosters until one has `len` entries
async fn roster_of_len(ws: &mut Ws, len: usize) -> Vec<Peer> {
    loop {
        let roster = next_roster(ws).await;
        if roster.len() == len {
            return roster;
        }
    }
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_forwarded(ws: &mut Ws) -> Forwarded {
    loop {
        if let ServerMessage::Signal(fwd) = next_message(ws).await {
            return fwd;
        }
    }
}

#[tokio::test]
async fn test_user_info_then_roster() {
    let (addr, _stop) = start_server().await;
    let mut ws = connect(addr, "?deviceName=Laptop").await;

    let me = user_info(&mut ws).await;
    assert_eq!(me.device_label, "Laptop");
    assert_eq!(me.ip.as_deref(), Some("127.0.0.1"));
    assert!(!me.display_name.is_empty());
    assert!(me.joined_at > 0);

    let roster = next_roster(&mut ws).await;
    assert_eq!(roster, vec![me]);
}

#[tokio::test]
async fn test_missing_device_name_uses_default() {
    let (addr, _stop) = start_server().await;
    let mut ws = connect(addr, "").await;
    assert_eq!(user_info(&mut ws).await.device_label, UNKNOWN_DEVICE);
}

#[tokio::test]
async fn test_roster_broadcast_on_join_and_leave() {
    let (addr, _stop) = start_server().await;
    let mut a = connect(addr, "?deviceName=A").await;
    let a_info = user_info(&mut a).await;
    roster_of_len(&mut a, 1).await;

    let mut b = connect(addr, "?deviceName=B").await;
    let b_info = user_info(&mut b).await;

    let roster = roster_of_len(&mut a, 2).await;
    let ids: Vec<&PeerId> = roster.iter().map(|p| &p.id).collect();
    assert!(ids.contains(&&a_info.id));
    assert!(ids.contains(&&b_info.id));
    assert_ne!(a_info.id, b_info.id);
    assert_ne!(a_info.display_name, b_info.display_name);

    b.close(None).await.unwrap();
    let roster = roster_of_len(&mut a, 1).await;
    assert_eq!(roster[0].id, a_info.id);
}

#[tokio::test]
async fn test_signal_routed_with_sender() {
    let (addr, _stop) = start_server().await;
    let mut a = connect(addr, "?deviceName=A").await;
    let a_info = user_info(&mut a).await;
    let mut b = connect(addr, "?deviceName=B").await;
    let b_info = user_info(&mut b).await;

    let payload = json!({"files": [{"id": "abcd1234", "name": "x.txt", "size": 3, "type": "text/plain"}]});
    send_json(
        &mut a,
        json!({"type": "invite", "target": b_info.id.as_str(), "payload": payload}),
    )
    .await;

    let fwd = next_forwarded(&mut b).await;
    assert_eq!(fwd.kind, SignalKind::Invite);
    assert_eq!(fwd.sender, a_info.id);
    assert_eq!(fwd.payload, payload);
}

#[tokio::test]
async fn test_signals_keep_order_and_skip_bad_input() {
    let (addr, _stop) = start_server().await;
    let mut a = connect(addr, "?deviceName=A").await;
    user_info(&mut a).await;
    let mut b = connect(addr, "?deviceName=B").await;
    let b_info = user_info(&mut b).await;
    let target = b_info.id.as_str();

    a.send(Message::Text("not json".to_string())).await.unwrap();
    send_json(&mut a, json!({"type": "teleport", "target": target, "payload": {}})).await;
    send_json(&mut a, json!({"type": "accept", "target": "999-nobody", "payload": {}})).await;
    for n in 0..5 {
        send_json(&mut a, json!({"type": "ice-candidate", "target": target, "payload": {"n": n}}))
            .await;
    }

    for n in 0..5 {
        let fwd = next_forwarded(&mut b).await;
        assert_eq!(fwd.kind, SignalKind::IceCandidate);
        assert_eq!(fwd.payload["n"], n);
    }
}

#[tokio::test]
async fn test_invalid_path_closed_with_policy_violation() {
    let (addr, _stop) = start_server().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/api")).await.unwrap();

    let frame = tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert_eq!(u16::from(close.code), 1008);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_signal_client_round_trip() {
    let (addr, _stop) = start_server().await;
    let mut raw = connect(addr, "?deviceName=Raw").await;
    let raw_info = user_info(&mut raw).await;

    let (client, sender, mut events) = SignalClient::connect(SignalClientConfig {
        server_url: format!("ws://{addr}/ws"),
        device_label: "Desk".to_string(),
        reconnect_delay: Duration::from_millis(100),
    })
    .unwrap();

    let mut me = None;
    while me.is_none() {
        match tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap() {
            Some(SignalEvent::Message(ServerMessage::Directory(DirectoryUpdate::UserInfo {
                data,
            }))) => me = Some(data),
            Some(_) => {}
            None => panic!("client stopped"),
        }
    }
    let me = me.unwrap();
    assert_eq!(me.device_label, "Desk");
    assert!(sender.is_connected());

    assert!(sender.signal(SignalKind::Offer, &raw_info.id, json!({"sdp": "x"})));
    let fwd = next_forwarded(&mut raw).await;
    assert_eq!(fwd.kind, SignalKind::Offer);
    assert_eq!(fwd.sender, me.id);

    send_json(
        &mut raw,
        json!({"type": "answer", "target": me.id.as_str(), "payload": {"sdp": "y"}}),
    )
    .await;
    loop {
        match tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap() {
            Some(SignalEvent::Message(ServerMessage::Signal(fwd))) => {
                assert_eq!(fwd.kind, SignalKind::Answer);
                assert_eq!(fwd.sender, raw_info.id);
                break;
            }
            Some(_) => {}
            None => panic!("client stopped"),
        }
    }

    client.shutdown().await;
    let roster = roster_of_len(&mut raw, 1).await;
    assert_eq!(roster[0].id, raw_info.id);
}
