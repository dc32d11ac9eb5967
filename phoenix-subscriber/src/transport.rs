//! Transport abstraction: anything that can open a full-duplex link carrying
//! text frames. [`WebSocketTransport`] is the default.

use std::pin::Pin;

use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use url::Url;

use crate::Error;

/// Outbound half of a link.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of a link. The stream ending or yielding an error means the
/// link is lost.
pub type FrameStream = BoxStream<'static, Result<String, Error>>;

/// One established link, split into its two halves.
pub struct TransportLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links to a server endpoint. The socket owns at most one link at a
/// time and calls `open` again for every reconnect attempt.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<TransportLink, Error>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// WebSocket transport over `tokio-tungstenite`. Text frames only; binary
/// frames are ignored, ping/pong is answered by tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink, Error> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (write, read) = ws.split();

        let sink = write.with(|text: String| {
            futures_util::future::ready(Ok::<_, Error>(tungstenite::Message::Text(text.into())))
        });
        let stream = read.filter_map(|frame| async move {
            match frame {
                Ok(tungstenite::Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(tungstenite::Message::Binary(data)) => {
                    tracing::debug!(len = data.len(), "Ignoring binary frame");
                    None
                }
                // Close is followed by the end of the stream
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            }
        });

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}
