//! Channel subscription: membership in one topic, the join/leave state
//! machine, and dispatch of inbound events to registered handlers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::protocol::{self, Frame, Reply};
use crate::socket::Inner;
use crate::types::{ChannelState, Error, HandlerRef, HandlerResult, Message};

pub(crate) type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

type JoinResult = Result<serde_json::Value, Error>;

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to one channel subscription, obtained from
/// [`Socket::channel`](crate::Socket::channel).
///
/// Cloning the handle does not create a new subscription. Once the channel
/// has been left, the handle is inert: `state()` reports `Left` and further
/// calls have no effect.
#[derive(Clone)]
pub struct Channel {
    id: u64,
    topic: String,
    state: watch::Receiver<ChannelState>,
    inner: Arc<Inner>,
}

impl Channel {
    pub(crate) fn new(
        id: u64,
        topic: String,
        state: watch::Receiver<ChannelState>,
        inner: Arc<Inner>,
    ) -> Self {
        Self {
            id,
            topic,
            state,
            inner,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition of this channel.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Register `handler` for `event`. Handlers for the same event run in
    /// registration order. A handler returning an error (or panicking) is
    /// logged and does not stop the handlers after it.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> HandlerRef
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        let event = event.into();
        if protocol::event::is_reserved(&event) {
            tracing::warn!(
                topic = %self.topic,
                event = %event,
                "Handler registered for a reserved protocol event will never run"
            );
        }
        self.inner
            .lock()
            .on(&self.topic, self.id, event, Arc::new(handler))
    }

    /// Unregister a handler. No effect if it was already removed.
    pub fn off(&self, event: &str, handler: HandlerRef) {
        self.inner.lock().off(&self.topic, self.id, event, handler);
    }

    /// Request membership. Idempotent while joining or joined.
    ///
    /// The returned [`JoinOutcome`] may be awaited for the server's join
    /// response; dropping it does not cancel the join.
    pub fn join(&self) -> JoinOutcome {
        let outcome = self
            .inner
            .lock()
            .join(&self.topic, self.id, Instant::now());
        self.inner.wake();
        outcome
    }

    /// Leave the channel. Resolves once the channel is left; an
    /// unacknowledged leave counts as left after the leave timeout.
    /// An `idle` or `errored` channel has no membership and is left at once.
    ///
    /// Fails with [`Error::LeaveSuperseded`] when [`join`](Channel::join) is
    /// called before the leave completes.
    pub async fn leave(&self) -> Result<(), Error> {
        let done = self
            .inner
            .lock()
            .leave(&self.topic, self.id, Instant::now());
        self.inner.wake();
        // A dropped sender means the subscription is already gone
        done.await.unwrap_or(Ok(()))
    }

    /// Send a caller-defined event on this channel's topic.
    pub fn push(&self, event: impl Into<String>, payload: serde_json::Value) {
        self.inner.send_frame(Frame::new(self.topic.clone(), event, payload, None));
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Join outcome
// ---------------------------------------------------------------------------

/// Settles once a join attempt reaches `joined` (with the server's
/// response) or fails.
pub struct JoinOutcome {
    topic: String,
    rx: oneshot::Receiver<JoinResult>,
}

impl JoinOutcome {
    fn pending(topic: &str) -> (oneshot::Sender<JoinResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                topic: topic.to_string(),
                rx,
            },
        )
    }

    fn settled(topic: &str, result: JoinResult) -> Self {
        let (tx, outcome) = Self::pending(topic);
        let _ = tx.send(result);
        outcome
    }

    pub(crate) fn closed(topic: &str) -> Self {
        Self::settled(
            topic,
            Err(Error::ChannelClosed {
                topic: topic.to_string(),
            }),
        )
    }

    pub async fn wait(self) -> JoinResult {
        let topic = self.topic;
        self.rx
            .await
            .unwrap_or(Err(Error::ChannelClosed { topic }))
    }
}

impl IntoFuture for JoinOutcome {
    type Output = JoinResult;
    type IntoFuture = Pin<Box<dyn Future<Output = JoinResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl fmt::Debug for JoinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinOutcome")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Per-channel state machine
// ---------------------------------------------------------------------------

/// Owned by the socket's registry. Methods never perform I/O: they return
/// the frames the caller must queue.
pub(crate) struct ChannelCore {
    id: u64,
    topic: String,
    join_payload: serde_json::Value,
    state: watch::Sender<ChannelState>,
    handlers: HashMap<String, Vec<(HandlerRef, Handler)>>,
    next_handler: u64,
    /// Ref of the most recent outstanding join request. `None` while a join
    /// is wanted but not yet sent.
    join_ref: Option<String>,
    leave_ref: Option<String>,
    response: serde_json::Value,
    deadline: Option<Instant>,
    join_waiters: Vec<oneshot::Sender<JoinResult>>,
    leave_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
}

impl ChannelCore {
    pub(crate) fn new(id: u64, topic: String, join_payload: serde_json::Value) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            id,
            topic,
            join_payload,
            state,
            handlers: HashMap::new(),
            next_handler: 0,
            join_ref: None,
            leave_ref: None,
            response: serde_json::Value::Null,
            deadline: None,
            join_waiters: Vec::new(),
            leave_waiters: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn set_state(&self, next: ChannelState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(topic = %self.topic, from = %prev, to = %next, "Channel state");
        }
    }

    // -- handlers -----------------------------------------------------------

    pub(crate) fn on(&mut self, event: String, handler: Handler) -> HandlerRef {
        self.next_handler += 1;
        let handler_ref = HandlerRef(self.next_handler);
        self.handlers
            .entry(event)
            .or_default()
            .push((handler_ref, handler));
        handler_ref
    }

    pub(crate) fn off(&mut self, event: &str, handler_ref: HandlerRef) -> bool {
        let Some(list) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(r, _)| *r != handler_ref);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }

    pub(crate) fn handlers_for(&self, event: &str) -> Vec<Handler> {
        self.handlers
            .get(event)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    // -- join ---------------------------------------------------------------

    /// Returns the outcome and whether a join request has to go out.
    pub(crate) fn request_join(&mut self) -> (JoinOutcome, bool) {
        match self.state() {
            ChannelState::Joined => (
                JoinOutcome::settled(&self.topic, Ok(self.response.clone())),
                false,
            ),
            ChannelState::Joining => {
                let (tx, outcome) = JoinOutcome::pending(&self.topic);
                self.join_waiters.push(tx);
                (outcome, false)
            }
            ChannelState::Left => (JoinOutcome::closed(&self.topic), false),
            ChannelState::Idle | ChannelState::Errored | ChannelState::Leaving => {
                self.leave_ref = None;
                self.deadline = None;
                for tx in self.leave_waiters.drain(..) {
                    let _ = tx.send(Err(Error::LeaveSuperseded {
                        topic: self.topic.clone(),
                    }));
                }
                let (tx, outcome) = JoinOutcome::pending(&self.topic);
                self.join_waiters.push(tx);
                self.set_state(ChannelState::Joining);
                (outcome, true)
            }
        }
    }

    /// Joining but no request on the current link yet.
    pub(crate) fn needs_join(&self) -> bool {
        self.state() == ChannelState::Joining && self.join_ref.is_none()
    }

    /// Issue a join request under a fresh ref; any earlier ref becomes stale.
    pub(crate) fn join_frame(&mut self, msg_ref: String, deadline: Instant) -> Frame {
        tracing::debug!(topic = %self.topic, join_ref = %msg_ref, "Sending join");
        self.join_ref = Some(msg_ref.clone());
        self.deadline = Some(deadline);
        protocol::build_join(&self.topic, &self.join_payload, msg_ref)
    }

    // -- leave --------------------------------------------------------------

    /// Returns a receiver settling once left, and whether a leave request has
    /// to go out. Without a live membership the channel is left at once.
    pub(crate) fn request_leave(
        &mut self,
        link_open: bool,
    ) -> (oneshot::Receiver<Result<(), Error>>, bool) {
        let (tx, rx) = oneshot::channel();
        match self.state() {
            ChannelState::Left => return (rx, false),
            ChannelState::Leaving => {
                self.leave_waiters.push(tx);
                return (rx, false);
            }
            ChannelState::Joined | ChannelState::Joining if link_open => {
                self.fail_join_waiters();
                self.join_ref = None;
                self.leave_waiters.push(tx);
                self.set_state(ChannelState::Leaving);
                return (rx, true);
            }
            _ => {}
        }
        self.leave_waiters.push(tx);
        self.mark_left();
        (rx, false)
    }

    pub(crate) fn leave_frame(&mut self, msg_ref: String, deadline: Instant) -> Frame {
        tracing::debug!(topic = %self.topic, leave_ref = %msg_ref, "Sending leave");
        self.leave_ref = Some(msg_ref.clone());
        self.deadline = Some(deadline);
        protocol::build_leave(&self.topic, msg_ref)
    }

    fn mark_left(&mut self) {
        self.fail_join_waiters();
        self.join_ref = None;
        self.leave_ref = None;
        self.deadline = None;
        for tx in self.leave_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
        self.set_state(ChannelState::Left);
        tracing::info!(topic = %self.topic, "Channel left");
    }

    fn fail_join_waiters(&mut self) {
        for tx in self.join_waiters.drain(..) {
            let _ = tx.send(Err(Error::ChannelClosed {
                topic: self.topic.clone(),
            }));
        }
    }

    fn settle_join(&mut self, make: impl Fn() -> JoinResult) {
        for tx in self.join_waiters.drain(..) {
            let _ = tx.send(make());
        }
    }

    // -- inbound ------------------------------------------------------------

    pub(crate) fn handle_reply(&mut self, msg_ref: &str, reply: Reply) {
        let state = self.state();
        if state == ChannelState::Joining && self.join_ref.as_deref() == Some(msg_ref) {
            self.deadline = None;
            if reply.is_ok() {
                self.response = reply.response;
                let response = self.response.clone();
                self.settle_join(|| Ok(response.clone()));
                self.set_state(ChannelState::Joined);
                tracing::info!(topic = %self.topic, "Channel joined");
            } else {
                self.join_ref = None;
                let topic = self.topic.clone();
                let response = reply.response;
                tracing::warn!(topic = %topic, response = %response, "Join rejected");
                self.settle_join(|| {
                    Err(Error::JoinRejected {
                        topic: topic.clone(),
                        response: response.clone(),
                    })
                });
                self.set_state(ChannelState::Errored);
            }
        } else if state == ChannelState::Leaving && self.leave_ref.as_deref() == Some(msg_ref) {
            self.mark_left();
        } else {
            tracing::trace!(topic = %self.topic, msg_ref, state = %state, "Discarding stale reply");
        }
    }

    /// Server reported the channel crashed.
    pub(crate) fn handle_server_error(&mut self) {
        match self.state() {
            ChannelState::Joining | ChannelState::Joined => {
                tracing::warn!(topic = %self.topic, "Channel errored on server");
                self.fail_join_waiters();
                self.join_ref = None;
                self.deadline = None;
                self.set_state(ChannelState::Errored);
            }
            ChannelState::Leaving => self.mark_left(),
            ChannelState::Idle | ChannelState::Left | ChannelState::Errored => {}
        }
    }

    /// Server closed the channel.
    pub(crate) fn handle_server_close(&mut self) {
        if self.state() != ChannelState::Left {
            self.mark_left();
        }
    }

    // -- timers and link lifecycle -----------------------------------------

    pub(crate) fn expire(&mut self, now: Instant) {
        if self.deadline.is_none_or(|d| d > now) {
            return;
        }
        self.deadline = None;
        match self.state() {
            ChannelState::Joining => {
                self.join_ref = None;
                let topic = self.topic.clone();
                tracing::warn!(topic = %topic, "Join timed out");
                self.settle_join(|| {
                    Err(Error::JoinTimeout {
                        topic: topic.clone(),
                    })
                });
                self.set_state(ChannelState::Errored);
            }
            ChannelState::Leaving => {
                tracing::debug!(topic = %self.topic, "Leave unacknowledged, treating as left");
                self.mark_left();
            }
            _ => {}
        }
    }

    /// The transport link went away. Membership must be re-established on
    /// the next link.
    pub(crate) fn link_lost(&mut self) {
        match self.state() {
            ChannelState::Joined | ChannelState::Joining => {
                self.join_ref = None;
                self.deadline = None;
                self.set_state(ChannelState::Joining);
            }
            ChannelState::Leaving => self.mark_left(),
            ChannelState::Idle | ChannelState::Left | ChannelState::Errored => {}
        }
    }

    /// The owning connection was explicitly closed.
    pub(crate) fn connection_closed(&mut self) {
        match self.state() {
            ChannelState::Left => {}
            ChannelState::Leaving => self.mark_left(),
            _ => {
                self.fail_join_waiters();
                self.join_ref = None;
                self.deadline = None;
                self.set_state(ChannelState::Errored);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Invoke every handler in order. Failures are isolated and logged; returns
/// how many handlers failed.
pub(crate) fn dispatch(handlers: &[Handler], message: &Message) -> usize {
    let mut failures = 0;
    for handler in handlers {
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_reason(payload.as_ref()),
        };
        failures += 1;
        let err = Error::HandlerFailure {
            topic: message.topic.clone(),
            event: message.event.clone(),
            message: reason,
        };
        tracing::warn!("{err}");
    }
    failures
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
