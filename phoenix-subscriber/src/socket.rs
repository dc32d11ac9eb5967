//! Public entry point: [`Socket`], the connection manager.
//!
//! The socket owns the shared connection state (outbound queue, channel
//! registry, ref counter). Caller-facing methods mutate it in short critical
//! sections and wake the background event loop in [`crate::connection`],
//! which owns the transport link.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::channel::{Channel, ChannelCore, Handler, JoinOutcome};
use crate::connection::{build_endpoint_url, run_event_loop};
use crate::protocol::{self, Frame, PHOENIX_TOPIC, Reply, event};
use crate::transport::{Transport, WebSocketTransport};
use crate::types::{
    ChannelState, Error, HandlerRef, Message, SocketConfig, SocketState, TimingConfig,
};

/// Handle to one logical connection.
///
/// Create it, [`connect`](Socket::connect), then ask it for channels.
/// Dropping the socket shuts the connection down.
pub struct Socket {
    inner: Arc<Inner>,
}

impl Socket {
    /// A socket over the default WebSocket transport.
    pub fn new(config: SocketConfig) -> Result<Self, Error> {
        Self::with_transport(config, WebSocketTransport)
    }

    /// A socket whose links are opened by `transport`.
    pub fn with_transport(config: SocketConfig, transport: impl Transport) -> Result<Self, Error> {
        let url = build_endpoint_url(&config.endpoint, &config.params)?;
        let (state, _) = watch::channel(SocketState::Closed);
        Ok(Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state,
                    outbound: VecDeque::new(),
                    channels: HashMap::new(),
                    next_ref: 0,
                    next_channel_id: 0,
                    cancel: None,
                    timing: config.timing.clone(),
                }),
                wake: Notify::new(),
                url,
                transport: Arc::new(transport),
                timing: config.timing,
            }),
        })
    }

    /// Full URL used for every connect attempt.
    pub fn endpoint_url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.inner.lock().state.subscribe()
    }

    /// Start the connection in the background. Idempotent while connecting
    /// or open; fails with [`Error::AlreadyClosing`] during shutdown.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self) -> Result<(), Error> {
        let mut shared = self.inner.lock();
        match shared.state() {
            SocketState::Closing => return Err(Error::AlreadyClosing),
            SocketState::Connecting | SocketState::Open | SocketState::Reconnecting => {
                return Ok(());
            }
            SocketState::Closed => {}
        }
        let runtime = tokio::runtime::Handle::try_current()?;
        let cancel = CancellationToken::new();
        shared.cancel = Some(cancel.clone());
        shared.transition(SocketState::Connecting);
        drop(shared);

        tracing::info!(url = %self.inner.url, "Connecting");
        runtime.spawn(run_event_loop(Arc::clone(&self.inner), cancel));
        Ok(())
    }

    /// Send an event on `topic`. Transmitted right away while open, otherwise
    /// queued and flushed in order once the link opens. The queue is
    /// unbounded and discarded on [`close`](Socket::close).
    pub fn send(
        &self,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) {
        self.inner.send_frame(Frame::new(topic, event, payload, None));
    }

    /// The channel for `topic`, created on first request. Does not join.
    /// For an existing channel `join_payload` is ignored.
    pub fn channel(&self, topic: impl Into<String>, join_payload: serde_json::Value) -> Channel {
        let topic = topic.into();
        let (id, state) = self.inner.lock().channel(&topic, join_payload);
        Channel::new(id, topic, state, Arc::clone(&self.inner))
    }

    /// Shut the connection down. Queued sends are dropped, channels end up
    /// `errored` (or `left` when they were leaving). Resolves once closed.
    pub async fn close(&self) {
        let mut state = {
            let mut shared = self.inner.lock();
            if shared.state() == SocketState::Closed {
                shared.release();
                return;
            }
            shared.begin_close();
            shared.state.subscribe()
        };
        let _ = state.wait_for(|s| *s == SocketState::Closed).await;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let mut shared = self.inner.lock();
        if shared.state() == SocketState::Closed {
            shared.release();
        } else {
            shared.begin_close();
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    shared: Mutex<Shared>,
    pub(crate) wake: Notify,
    pub(crate) url: Url,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) timing: TimingConfig,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn send_frame(&self, frame: Frame) {
        let queued = self.lock().enqueue(frame);
        if queued {
            self.wake();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundKind {
    /// Join, leave, heartbeat: only meaningful on the link they were issued for.
    Control,
    Caller,
}

#[derive(Debug)]
pub(crate) struct Outbound {
    pub frame: Frame,
    pub kind: OutboundKind,
}

/// What the event loop must do with a routed inbound frame.
pub(crate) enum Routed {
    HeartbeatReply(Option<String>),
    Dispatch(Vec<Handler>, Message),
    Consumed,
}

pub(crate) struct Shared {
    state: watch::Sender<SocketState>,
    pub(crate) outbound: VecDeque<Outbound>,
    channels: HashMap<String, ChannelCore>,
    next_ref: u64,
    next_channel_id: u64,
    cancel: Option<CancellationToken>,
    timing: TimingConfig,
}

impl Shared {
    pub(crate) fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Apply a connection state change. Nothing but `Closed` may follow
    /// `Closing`; returns `false` when the change was refused.
    pub(crate) fn transition(&mut self, next: SocketState) -> bool {
        let prev = self.state();
        if prev == SocketState::Closing && next != SocketState::Closed {
            return false;
        }
        self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "Socket state");
        }
        true
    }

    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn core_mut(&mut self, topic: &str, id: u64) -> Option<&mut ChannelCore> {
        self.channels.get_mut(topic).filter(|c| c.id() == id)
    }

    fn remove_left(&mut self) {
        self.channels.retain(|_, c| c.state() != ChannelState::Left);
    }

    fn begin_close(&mut self) {
        self.transition(SocketState::Closing);
        self.outbound.clear();
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }

    // -- caller operations ---------------------------------------------------

    fn enqueue(&mut self, frame: Frame) -> bool {
        if self.state() == SocketState::Closing {
            tracing::debug!(topic = %frame.topic, event = %frame.event, "Dropping send while closing");
            return false;
        }
        self.outbound.push_back(Outbound {
            frame,
            kind: OutboundKind::Caller,
        });
        true
    }

    fn channel(
        &mut self,
        topic: &str,
        join_payload: serde_json::Value,
    ) -> (u64, watch::Receiver<ChannelState>) {
        if let Some(core) = self.channels.get(topic) {
            return (core.id(), core.watch_state());
        }
        self.next_channel_id += 1;
        let core = ChannelCore::new(self.next_channel_id, topic.to_string(), join_payload);
        let handle = (core.id(), core.watch_state());
        self.channels.insert(topic.to_string(), core);
        handle
    }

    pub(crate) fn on(&mut self, topic: &str, id: u64, event: String, handler: Handler) -> HandlerRef {
        match self.core_mut(topic, id) {
            Some(core) => core.on(event, handler),
            None => {
                tracing::debug!(topic, "Handler registered on a channel that was left");
                HandlerRef(0)
            }
        }
    }

    pub(crate) fn off(&mut self, topic: &str, id: u64, event: &str, handler: HandlerRef) {
        if let Some(core) = self.core_mut(topic, id) {
            core.off(event, handler);
        }
    }

    pub(crate) fn join(&mut self, topic: &str, id: u64, now: Instant) -> JoinOutcome {
        let open = self.state() == SocketState::Open;
        let deadline = now + self.timing.join_timeout;
        let Some(core) = self.channels.get_mut(topic).filter(|c| c.id() == id) else {
            return JoinOutcome::closed(topic);
        };
        let (outcome, send) = core.request_join();
        if send && open {
            self.next_ref += 1;
            let frame = core.join_frame(self.next_ref.to_string(), deadline);
            self.outbound.push_back(Outbound {
                frame,
                kind: OutboundKind::Control,
            });
        }
        outcome
    }

    pub(crate) fn leave(
        &mut self,
        topic: &str,
        id: u64,
        now: Instant,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let open = self.state() == SocketState::Open;
        let deadline = now + self.timing.leave_timeout;
        let Some(core) = self.channels.get_mut(topic).filter(|c| c.id() == id) else {
            let (_, rx) = oneshot::channel();
            return rx;
        };
        let (done, send) = core.request_leave(open);
        if send {
            self.next_ref += 1;
            let frame = core.leave_frame(self.next_ref.to_string(), deadline);
            self.outbound.push_back(Outbound {
                frame,
                kind: OutboundKind::Control,
            });
        }
        self.remove_left();
        done
    }

    // -- event loop hooks ----------------------------------------------------

    /// Link established: issue a fresh join for every channel that wants
    /// membership, ahead of queued caller sends.
    pub(crate) fn on_open(&mut self, now: Instant) -> bool {
        if !self.transition(SocketState::Open) {
            return false;
        }
        let deadline = now + self.timing.join_timeout;
        let mut pending: Vec<&mut ChannelCore> =
            self.channels.values_mut().filter(|c| c.needs_join()).collect();
        pending.sort_by_key(|c| c.id());
        let mut joins = Vec::with_capacity(pending.len());
        for core in pending {
            self.next_ref += 1;
            joins.push(core.join_frame(self.next_ref.to_string(), deadline));
        }
        for frame in joins.into_iter().rev() {
            self.outbound.push_front(Outbound {
                frame,
                kind: OutboundKind::Control,
            });
        }
        true
    }

    /// Link lost or connect failed. Control frames for the dead link are
    /// dropped; caller sends stay queued.
    pub(crate) fn on_link_lost(&mut self) -> bool {
        if !self.transition(SocketState::Reconnecting) {
            return false;
        }
        self.outbound.retain(|o| o.kind == OutboundKind::Caller);
        for core in self.channels.values_mut() {
            core.link_lost();
        }
        self.remove_left();
        true
    }

    pub(crate) fn finish_close(&mut self) {
        self.cancel = None;
        self.release();
        self.transition(SocketState::Closed);
    }

    /// Discard queued sends and end every channel's membership.
    fn release(&mut self) {
        self.outbound.clear();
        for core in self.channels.values_mut() {
            core.connection_closed();
        }
        self.remove_left();
    }

    pub(crate) fn push_heartbeat(&mut self) -> String {
        let msg_ref = self.next_ref();
        self.outbound.push_back(Outbound {
            frame: protocol::build_heartbeat(msg_ref.clone()),
            kind: OutboundKind::Control,
        });
        msg_ref
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.channels.values().filter_map(ChannelCore::deadline).min()
    }

    pub(crate) fn expire(&mut self, now: Instant) {
        for core in self.channels.values_mut() {
            core.expire(now);
        }
        self.remove_left();
    }

    pub(crate) fn route(&mut self, frame: Frame) -> Routed {
        if frame.topic == PHOENIX_TOPIC {
            if frame.is_reply() {
                return Routed::HeartbeatReply(frame.msg_ref);
            }
            tracing::debug!(event = %frame.event, "Ignoring frame on the phoenix topic");
            return Routed::Consumed;
        }
        let Some(core) = self.channels.get_mut(&frame.topic) else {
            tracing::debug!(topic = %frame.topic, event = %frame.event, "Dropping frame for unknown topic");
            return Routed::Consumed;
        };
        match frame.event.as_str() {
            event::REPLY => match frame.msg_ref.as_deref() {
                Some(msg_ref) => core.handle_reply(msg_ref, Reply::from_payload(&frame.payload)),
                None => tracing::debug!(topic = %frame.topic, "Reply without ref"),
            },
            event::ERROR => core.handle_server_error(),
            event::CLOSE => core.handle_server_close(),
            name if event::is_reserved(name) => {
                tracing::debug!(topic = %frame.topic, event = name, "Ignoring reserved event");
            }
            name => {
                let handlers = core.handlers_for(name);
                if handlers.is_empty() {
                    tracing::trace!(topic = %frame.topic, event = name, "No handlers for event");
                    return Routed::Consumed;
                }
                return Routed::Dispatch(handlers, Message::from(frame));
            }
        }
        self.remove_left();
        Routed::Consumed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
