//! Phoenix channels wire protocol (JSON serializer v1): frame type, reserved
//! event names, and encode/decode helpers.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Message};

/// Protocol version advertised in the connect URL.
pub const VSN: &str = "1.0.0";

/// Topic carrying connection-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

// ---------------------------------------------------------------------------
// Reserved event names
// ---------------------------------------------------------------------------

pub mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";

    /// Events consumed by the protocol state machines and never handed to
    /// caller handlers.
    pub fn is_reserved(name: &str) -> bool {
        matches!(name, JOIN | LEAVE | REPLY | ERROR | CLOSE)
    }
}

pub mod status {
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
}

// ---------------------------------------------------------------------------
// Wire frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ref", default, deserialize_with = "lenient_ref")]
    pub msg_ref: Option<String>,
}

impl Frame {
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
        msg_ref: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.event == event::REPLY
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Message {
            topic: frame.topic,
            event: frame.event,
            payload: frame.payload,
            msg_ref: frame.msg_ref,
        }
    }
}

/// Servers echo refs back as strings, but some send bare numbers.
fn lenient_ref<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
    )
}

pub fn encode(frame: &Frame) -> Result<String, Error> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode(text: &str) -> Result<Frame, Error> {
    Ok(serde_json::from_str(text)?)
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Parsed `phx_reply` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub response: serde_json::Value,
}

impl Reply {
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_else(|e| {
            tracing::debug!("Malformed reply payload: {e}");
            Reply {
                status: String::new(),
                response: serde_json::Value::Null,
            }
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

pub fn build_join(topic: &str, payload: &serde_json::Value, msg_ref: String) -> Frame {
    Frame::new(topic, event::JOIN, payload.clone(), Some(msg_ref))
}

pub fn build_leave(topic: &str, msg_ref: String) -> Frame {
    Frame::new(topic, event::LEAVE, serde_json::json!({}), Some(msg_ref))
}

pub fn build_heartbeat(msg_ref: String) -> Frame {
    Frame::new(
        PHOENIX_TOPIC,
        event::HEARTBEAT,
        serde_json::json!({}),
        Some(msg_ref),
    )
}

pub fn build_reply(
    topic: &str,
    msg_ref: &str,
    status: &str,
    response: serde_json::Value,
) -> Frame {
    Frame::new(
        topic,
        event::REPLY,
        serde_json::json!({ "status": status, "response": response }),
        Some(msg_ref.to_string()),
    )
}

/// Topic for one resource within a scope, e.g. `topic("cameras", 42)` is
/// `"cameras:42"`.
pub fn topic(scope: &str, id: impl fmt::Display) -> String {
    format!("{scope}:{id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
