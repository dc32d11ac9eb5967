//! Phoenix channels subscription client.
//!
//! Multiplexes channel subscriptions over a single WebSocket connection to a
//! Phoenix server (JSON serializer v1) and dispatches pushed events to
//! registered handlers.
//!
//! # Features
//! - One background connection per [`Socket`], reconnecting with exponential
//!   backoff and jitter, forever, until closed
//! - Heartbeat-based connection liveness detection
//! - Automatic rejoin of every subscription after a reconnect, with stale
//!   join replies discarded by reference
//! - Ordered per-event handlers whose failures are isolated and logged
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), phoenix_subscriber::Error> {
//! use phoenix_subscriber::{Socket, SocketConfig, protocol};
//!
//! let socket = Socket::new(SocketConfig::new("ws://localhost:4000/ws"))?;
//! socket.connect()?;
//!
//! let channel = socket.channel(protocol::topic("cameras", 42), serde_json::json!({}));
//! channel.on("snapshot-taken", |msg| {
//!     println!("snapshot: {} bytes of base64", msg.payload["image"].as_str().map_or(0, str::len));
//!     Ok(())
//! });
//! channel.join().await?;
//!
//! // ...
//! socket.close().await;
//! # Ok(())
//! # }
//! ```

mod channel;
mod connection;
pub mod protocol;
mod socket;
pub mod transport;
mod types;

pub use channel::{Channel, JoinOutcome};
pub use socket::Socket;
pub use transport::{Transport, TransportLink, WebSocketTransport};
pub use types::{
    BackoffConfig, BoxError, ChannelState, Error, HandlerRef, HandlerResult, Message,
    SocketConfig, SocketState, TimingConfig,
};
