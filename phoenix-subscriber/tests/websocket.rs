//! End-to-end tests over a real loopback WebSocket.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use common::{RECV_TIMEOUT, test_timing, wait_for_state};
use futures_util::{SinkExt, StreamExt};
use phoenix_subscriber::protocol::{self, Frame, event, status};
use phoenix_subscriber::{ChannelState, Message, Socket, SocketConfig, SocketState};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct MockPhoenixServer {
    listener: TcpListener,
    port: u16,
}

impl MockPhoenixServer {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn config(&self) -> SocketConfig {
        let mut config = SocketConfig::new(format!("ws://127.0.0.1:{}/ws", self.port));
        config.timing = test_timing();
        config
    }

    /// Accept one WebSocket connection and return it with the request URI.
    async fn accept(&self) -> Result<(WsStream, String), Box<dyn std::error::Error>> {
        let (tcp, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept()).await??;
        let uri = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&uri);
        let ws = tokio_tungstenite::accept_hdr_async(
            tcp,
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *seen.lock().unwrap() = req.uri().to_string();
                Ok(resp)
            },
        )
        .await?;
        let uri = uri.lock().unwrap().clone();
        Ok((ws, uri))
    }
}

/// Next non-heartbeat text frame from the client.
async fn read_frame(ws: &mut WsStream) -> Result<Frame, Box<dyn std::error::Error>> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await?
            .ok_or("WebSocket closed unexpectedly")??;
        if let tungstenite::Message::Text(text) = msg {
            let frame = protocol::decode(text.as_str())?;
            if frame.event != event::HEARTBEAT {
                return Ok(frame);
            }
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
    ws.send(tungstenite::Message::Text(protocol::encode(frame)?.into()))
        .await?;
    Ok(())
}

async fn reply_ok(ws: &mut WsStream, request: &Frame) -> Result<(), Box<dyn std::error::Error>> {
    let msg_ref = request.msg_ref.as_deref().ok_or("request without ref")?;
    let reply = protocol::build_reply(&request.topic, msg_ref, status::OK, serde_json::json!({}));
    send_frame(ws, &reply).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribes_over_websocket() {
    let server = MockPhoenixServer::start().await.unwrap();
    let mut config = server.config();
    config.params.insert("token".into(), "secret".into());
    let socket = Socket::new(config).unwrap();
    socket.connect().unwrap();

    let (mut ws, uri) = server.accept().await.unwrap();
    assert_eq!(uri, "/ws/websocket?token=secret&vsn=1.0.0");

    let topic = protocol::topic("cameras", 42);
    let channel = socket.channel(topic.clone(), serde_json::json!({}));
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    channel.on("snapshot-taken", move |msg| {
        let _ = tx.send(msg.clone());
        Ok(())
    });

    let outcome = channel.join();
    let join = read_frame(&mut ws).await.unwrap();
    assert_eq!(join.topic, "cameras:42");
    assert_eq!(join.event, event::JOIN);
    reply_ok(&mut ws, &join).await.unwrap();
    outcome.wait().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Joined);

    let image = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG fake");
    let push = Frame::new(
        topic.as_str(),
        "snapshot-taken",
        serde_json::json!({ "image": image }),
        None,
    );
    send_frame(&mut ws, &push).await.unwrap();

    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(msg.payload["image"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, b"\x89PNG fake");

    socket.send(topic.as_str(), "ping", serde_json::json!({"n": 1}));
    let ping = read_frame(&mut ws).await.unwrap();
    assert_eq!(ping.event, "ping");
    assert_eq!(ping.payload["n"], 1);
    assert!(ping.msg_ref.is_none());
}

#[tokio::test]
async fn rejoins_after_server_drops_connection() {
    let server = MockPhoenixServer::start().await.unwrap();
    let socket = Socket::new(server.config()).unwrap();
    socket.connect().unwrap();
    let (mut ws, _) = server.accept().await.unwrap();

    let channel = socket.channel("cameras:7", serde_json::json!({"token": "t"}));
    let _outcome = channel.join();
    let first = read_frame(&mut ws).await.unwrap();
    reply_ok(&mut ws, &first).await.unwrap();
    wait_for_state(&mut channel.watch_state(), ChannelState::Joined).await;

    drop(ws);
    let (mut ws, _) = server.accept().await.unwrap();
    let rejoin = read_frame(&mut ws).await.unwrap();
    assert_eq!(rejoin.event, event::JOIN);
    assert_eq!(rejoin.payload, serde_json::json!({"token": "t"}));
    assert_ne!(rejoin.msg_ref, first.msg_ref);

    reply_ok(&mut ws, &rejoin).await.unwrap();
    wait_for_state(&mut channel.watch_state(), ChannelState::Joined).await;
    assert_eq!(socket.state(), SocketState::Open);
}

#[tokio::test]
async fn binary_and_malformed_frames_are_ignored() {
    let server = MockPhoenixServer::start().await.unwrap();
    let socket = Socket::new(server.config()).unwrap();
    socket.connect().unwrap();
    let (mut ws, _) = server.accept().await.unwrap();

    let channel = socket.channel("cameras:1", serde_json::json!({}));
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    channel.on("snapshot-taken", move |msg| {
        let _ = tx.send(msg.clone());
        Ok(())
    });
    let _outcome = channel.join();
    let join = read_frame(&mut ws).await.unwrap();
    reply_ok(&mut ws, &join).await.unwrap();

    ws.send(tungstenite::Message::Binary(vec![1u8, 2, 3].into()))
        .await
        .unwrap();
    ws.send(tungstenite::Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    let push = Frame::new("cameras:1", "snapshot-taken", serde_json::json!({"n": 1}), None);
    send_frame(&mut ws, &push).await.unwrap();

    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload["n"], 1);
    assert_eq!(channel.state(), ChannelState::Joined);
    assert_eq!(socket.state(), SocketState::Open);
}

#[tokio::test]
async fn close_sends_websocket_close() {
    let server = MockPhoenixServer::start().await.unwrap();
    let socket = Socket::new(server.config()).unwrap();
    socket.connect().unwrap();
    let (mut ws, _) = server.accept().await.unwrap();

    tokio::time::timeout(RECV_TIMEOUT, socket.close())
        .await
        .unwrap();
    assert_eq!(socket.state(), SocketState::Closed);

    let closed = tokio::time::timeout(RECV_TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(tungstenite::Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);

    // No reconnect after an explicit close
    let again = tokio::time::timeout(Duration::from_millis(200), server.listener.accept()).await;
    assert!(again.is_err());
}
