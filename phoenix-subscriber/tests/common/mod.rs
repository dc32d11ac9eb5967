//! In-memory transport for driving a `Socket` from tests.
//!
//! `MockTransport` hands every link it opens to the paired `MockServer`,
//! which yields one `MockPeer` per accepted connection.

#![allow(dead_code, clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use phoenix_subscriber::protocol::{self, Frame, event, status};
use phoenix_subscriber::transport::TransportLink;
use phoenix_subscriber::{
    BackoffConfig, ChannelState, Error, SocketConfig, TimingConfig, Transport,
};
use tokio::sync::{mpsc, watch};
use url::Url;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Short timeouts, no jitter, heartbeats effectively off.
pub fn test_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_millis(500),
        join_timeout: Duration::from_millis(400),
        leave_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(1),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        },
    }
}

pub fn test_config() -> SocketConfig {
    let mut config = SocketConfig::new("ws://localhost:4000/ws");
    config.timing = test_timing();
    config
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct MockTransport {
    peers: mpsc::UnboundedSender<MockPeer>,
    refuse: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
}

pub struct MockServer {
    peers: mpsc::UnboundedReceiver<MockPeer>,
    refuse: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
}

pub fn mock_transport() -> (MockTransport, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicUsize::new(0));
    let urls = Arc::new(Mutex::new(Vec::new()));
    (
        MockTransport {
            peers: tx,
            refuse: Arc::clone(&refuse),
            urls: Arc::clone(&urls),
        },
        MockServer {
            peers: rx,
            refuse,
            urls,
        },
    )
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink, Error> {
        self.urls.lock().unwrap().push(url.to_string());

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Transport("connection refused".into()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, from_server) = mpsc::unbounded_channel::<Result<String, Error>>();

        let sink = futures_util::sink::unfold(to_server, |tx, text: String| async move {
            tx.send(text)
                .map_err(|_| Error::Transport("peer closed".into()))?;
            Ok::<_, Error>(tx)
        });
        let stream = futures_util::stream::unfold(from_server, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        self.peers
            .send(MockPeer {
                from_client,
                to_client: Some(to_client),
            })
            .map_err(|_| Error::Transport("server gone".into()))?;

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

impl MockServer {
    /// Wait for the client to open the next link.
    pub async fn accept(&mut self) -> MockPeer {
        tokio::time::timeout(Duration::from_secs(5), self.peers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }

    /// `None` if no link is opened within `wait`.
    pub async fn try_accept(&mut self, wait: Duration) -> Option<MockPeer> {
        tokio::time::timeout(wait, self.peers.recv())
            .await
            .ok()
            .flatten()
    }

    /// Fail the next `n` connect attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Server side of one link.
pub struct MockPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Result<String, Error>>>,
}

impl MockPeer {
    /// Next frame from the client, heartbeats included.
    pub async fn recv_raw(&mut self) -> Frame {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.from_client.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("client closed the link");
        protocol::decode(&text).expect("client sent an undecodable frame")
    }

    /// Next non-heartbeat frame from the client.
    pub async fn recv(&mut self) -> Frame {
        loop {
            let frame = self.recv_raw().await;
            if frame.event != event::HEARTBEAT {
                return frame;
            }
        }
    }

    /// Next frame with the given event, skipping everything else.
    pub async fn recv_event(&mut self, name: &str) -> Frame {
        loop {
            let frame = self.recv_raw().await;
            if frame.event == name {
                return frame;
            }
        }
    }

    /// Asserts the client sends nothing but heartbeats for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.from_client.recv()).await {
                Err(_) => return,
                Ok(None) => return,
                Ok(Some(text)) => {
                    let frame = protocol::decode(&text).expect("undecodable frame");
                    if frame.event != event::HEARTBEAT {
                        panic!("expected silence, got {frame:?}");
                    }
                }
            }
        }
    }

    pub fn push(&self, frame: Frame) {
        let text = protocol::encode(&frame).expect("encode");
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(text));
        }
    }

    pub fn push_event(&self, topic: &str, name: &str, payload: serde_json::Value) {
        self.push(Frame::new(topic, name, payload, None));
    }

    pub fn reply_ok(&self, request: &Frame, response: serde_json::Value) {
        self.reply(request, status::OK, response);
    }

    pub fn reply_error(&self, request: &Frame, response: serde_json::Value) {
        self.reply(request, status::ERROR, response);
    }

    fn reply(&self, request: &Frame, status: &str, response: serde_json::Value) {
        let msg_ref = request.msg_ref.as_deref().expect("request without ref");
        self.push(protocol::build_reply(&request.topic, msg_ref, status, response));
    }

    /// Reply to a stale request ref on this link.
    pub fn reply_ok_to_ref(&self, topic: &str, msg_ref: &str) {
        self.push(protocol::build_reply(topic, msg_ref, status::OK, serde_json::json!({})));
    }

    /// Inject a transport error; the client treats the link as lost.
    pub fn fail(&self) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(Error::Transport("connection reset".into())));
        }
    }

    /// Resolves once the client drops its end of the link.
    pub async fn wait_closed(&mut self) {
        let closed = tokio::time::timeout(RECV_TIMEOUT, async {
            while self.from_client.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "client kept the link open");
    }

    /// End the inbound stream as if the server closed the socket.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }
}

// ---------------------------------------------------------------------------
// State helpers
// ---------------------------------------------------------------------------

pub async fn wait_for_state(rx: &mut watch::Receiver<ChannelState>, want: ChannelState) {
    let reached = tokio::time::timeout(RECV_TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    assert!(reached, "channel never reached {want}, now {}", *rx.borrow());
}
