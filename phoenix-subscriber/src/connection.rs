//! Connection management: background event loop, heartbeat, and reconnection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Error;
use crate::channel::dispatch;
use crate::protocol::{self, VSN};
use crate::socket::{Inner, Routed};
use crate::transport::{FrameSink, TransportLink};
use crate::types::{BackoffConfig, SocketState};

/// Upper bound on the close handshake once shutdown is requested.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Path segment the Phoenix WebSocket transport is mounted under.
const TRANSPORT_SEGMENT: &str = "websocket";

// ---------------------------------------------------------------------------
// Endpoint URL
// ---------------------------------------------------------------------------

/// `ws://host/ws` becomes `ws://host/ws/websocket?<params>&vsn=1.0.0`.
pub(crate) fn build_endpoint_url(
    endpoint: &str,
    params: &BTreeMap<String, String>,
) -> Result<Url, Error> {
    let mut url = Url::parse(endpoint)?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => set_scheme(&mut url, "ws")?,
        "https" => set_scheme(&mut url, "wss")?,
        other => {
            return Err(Error::Transport(format!(
                "unsupported endpoint scheme {other:?}"
            )));
        }
    }

    let has_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|last| last == TRANSPORT_SEGMENT);
    if !has_segment {
        let path = format!("{}/{TRANSPORT_SEGMENT}", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }

    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params {
            query.append_pair(key, value);
        }
        query.append_pair("vsn", VSN);
    }
    Ok(url)
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<(), Error> {
    url.set_scheme(scheme)
        .map_err(|()| Error::Transport(format!("cannot use scheme {scheme:?} for {url}")))
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before reconnect attempt `attempt` (1-based): `initial * multiplier^(attempt-1)`,
/// capped at `max_delay`, plus up to `jitter` of that as random spread.
pub(crate) fn backoff_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30);
    let base = (config.initial_delay.as_secs_f64()
        * config.multiplier.max(1.0).powi(i32::try_from(exp).unwrap_or(30)))
    .min(config.max_delay.as_secs_f64());

    // Use subsecond nanos from wall clock for non-deterministic jitter
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let unit = f64::from(nanos) / 1_000_000_000.0;
    let jitter = base * config.jitter.clamp(0.0, 1.0) * unit;

    Duration::try_from_secs_f64(base + jitter).unwrap_or(config.max_delay)
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

enum LinkExit {
    Closed,
    Lost(String),
}

/// Owns the transport link for the lifetime of one `connect()`: connects,
/// runs the open link, and reconnects with backoff until cancelled.
pub(crate) async fn run_event_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        let connect = tokio::time::timeout(
            inner.timing.connect_timeout,
            inner.transport.open(&inner.url),
        );
        let opened = tokio::select! {
            res = connect => res,
            () = cancel.cancelled() => break,
        };

        let reason = match opened {
            Ok(Ok(link)) => {
                let opened = inner.lock().on_open(Instant::now());
                if !opened {
                    break;
                }
                attempt = 0;
                tracing::info!(url = %inner.url, "Connected");
                match run_open(&inner, link, &cancel).await {
                    LinkExit::Closed => break,
                    LinkExit::Lost(reason) => reason,
                }
            }
            Ok(Err(e)) => format!("connect failed: {e}"),
            Err(_) => "connect timed out".to_string(),
        };

        let reconnecting = inner.lock().on_link_lost();
        if !reconnecting {
            break;
        }
        attempt = attempt.saturating_add(1);
        let delay = backoff_delay(&inner.timing.backoff, attempt);
        tracing::warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Connection lost ({reason}), reconnecting"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => break,
        }
        let connecting = inner.lock().transition(SocketState::Connecting);
        if !connecting {
            break;
        }
    }

    inner.lock().finish_close();
    tracing::info!("Connection closed");
}

/// Drive one open link until it is lost or shutdown is requested.
async fn run_open(inner: &Inner, link: TransportLink, cancel: &CancellationToken) -> LinkExit {
    let TransportLink {
        mut sink,
        mut stream,
    } = link;
    let timing = &inner.timing;
    let period = timing.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending_heartbeat: Option<(String, Instant)> = None;

    loop {
        if let Err(e) = flush_outbound(inner, &mut sink).await {
            return LinkExit::Lost(format!("send failed: {e}"));
        }
        let channel_deadline = inner.lock().next_deadline();
        let heartbeat_deadline = pending_heartbeat.as_ref().map(|(_, at)| *at);

        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => handle_text(inner, &text, &mut pending_heartbeat),
                Some(Err(e)) => return LinkExit::Lost(format!("transport error: {e}")),
                None => return LinkExit::Lost("transport closed".to_string()),
            },

            () = inner.wake.notified() => {}

            _ = heartbeat.tick() => {
                if pending_heartbeat.is_none() {
                    let msg_ref = inner.lock().push_heartbeat();
                    tracing::trace!(msg_ref = %msg_ref, "Heartbeat");
                    pending_heartbeat = Some((msg_ref, Instant::now() + timing.heartbeat_timeout));
                }
            }

            () = sleep_until_opt(heartbeat_deadline) => {
                return LinkExit::Lost("heartbeat timeout".to_string());
            }

            () = sleep_until_opt(channel_deadline) => {
                inner.lock().expire(Instant::now());
            }

            () = cancel.cancelled() => {
                tracing::info!("Close requested");
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return LinkExit::Closed;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Transmit queued frames in order. A frame that fails to send stays at the
/// head of the queue.
async fn flush_outbound(inner: &Inner, sink: &mut FrameSink) -> Result<(), Error> {
    loop {
        let next = inner.lock().outbound.pop_front();
        let Some(outbound) = next else {
            return Ok(());
        };
        let text = match protocol::encode(&outbound.frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(topic = %outbound.frame.topic, "Dropping unencodable frame: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            inner.lock().outbound.push_front(outbound);
            return Err(e);
        }
    }
}

fn handle_text(inner: &Inner, text: &str, pending_heartbeat: &mut Option<(String, Instant)>) {
    let frame = match protocol::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Failed to decode frame: {e}");
            return;
        }
    };
    let routed = inner.lock().route(frame);
    match routed {
        Routed::HeartbeatReply(msg_ref) => {
            let matches = pending_heartbeat
                .as_ref()
                .is_some_and(|(pending, _)| msg_ref.as_deref() == Some(pending.as_str()));
            if matches {
                *pending_heartbeat = None;
            }
        }
        // Handlers run outside the lock so they may call back into the socket
        Routed::Dispatch(handlers, message) => {
            dispatch(&handlers, &message);
        }
        Routed::Consumed => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
