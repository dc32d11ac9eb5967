//! Public types for the phoenix-subscriber crate.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// A boxed error type for event handlers and transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by an event handler registered with
/// [`Channel::on`](crate::Channel::on).
pub type HandlerResult = Result<(), BoxError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a [`Socket`](crate::Socket).
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Socket endpoint, e.g. `"ws://localhost:4000/ws"`. The `/websocket`
    /// transport segment is appended when missing.
    pub endpoint: String,
    /// Extra query parameters sent when the transport connects (e.g. a token).
    pub params: BTreeMap<String, String>,
    /// Heartbeat, timeout, and reconnect timing.
    pub timing: TimingConfig,
}

impl SocketConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            timing: TimingConfig::default(),
        }
    }
}

/// Timing knobs. Defaults suit a browser-like viewer; tests shrink them.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Period between keep-alive frames while the link is open.
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may go unanswered before the link is considered lost.
    pub heartbeat_timeout: Duration,
    /// How long a join request may go unanswered before the channel errors.
    pub join_timeout: Duration,
    /// How long to wait for a leave acknowledgement. Expiry counts as left.
    pub leave_timeout: Duration,
    /// Upper bound on a single transport connect attempt.
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential reconnect backoff with jitter. There is no retry cap.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(15),
            jitter: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Connection Manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Connecting,
    Open,
    /// Transport lost or connect failed; waiting out the backoff delay.
    Reconnecting,
    Closing,
}

impl SocketState {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketState::Closed => "closed",
            SocketState::Connecting => "connecting",
            SocketState::Open => "open",
            SocketState::Reconnecting => "reconnecting",
            SocketState::Closing => "closing",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Joining,
    Joined,
    Leaving,
    Left,
    Errored,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
            ChannelState::Left => "left",
            ChannelState::Errored => "errored",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Messages and handlers
// ---------------------------------------------------------------------------

/// An inbound event delivered to a channel's handlers.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    /// Event name (e.g. `"snapshot-taken"`).
    pub event: String,
    pub payload: serde_json::Value,
    pub msg_ref: Option<String>,
}

/// Identifies one registered handler; pass it to
/// [`Channel::off`](crate::Channel::off) to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef(pub(crate) u64);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("join rejected on {topic}: {response}")]
    JoinRejected {
        topic: String,
        response: serde_json::Value,
    },

    #[error("join timed out on {topic}")]
    JoinTimeout { topic: String },

    #[error("handler for {event:?} on {topic} failed: {message}")]
    HandlerFailure {
        topic: String,
        event: String,
        message: String,
    },

    #[error("connection is closing")]
    AlreadyClosing,

    #[error("channel {topic} closed before the join settled")]
    ChannelClosed { topic: String },

    #[error("leave of {topic} superseded by a new join")]
    LeaveSuperseded { topic: String },

    #[error("frame encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("no Tokio runtime to run the connection: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
