//! Physical link factories.
//!
//! A [`Connector`] produces one full-duplex text link per call. The transport
//! calls it on every (re)connect and never reuses a link after it fails.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use relay_core::TransportError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

/// Something received on a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// An application text frame.
    Text(String),
    /// Liveness traffic (ping/pong) with no application payload.
    Heartbeat,
}

/// Outbound half of a link.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a link. Ends (`None`) or yields `Err` when the link dies.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, TransportError>> + Send>>;

/// Opens physical links.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link.
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// WebSocket links via `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connector for `ws://` or `wss://` `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Endpoint this connector dials.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "websocket handshake complete");

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| TransportError::Socket(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(text.into()))));

        let stream = read.filter_map(|msg| future::ready(classify(msg)));

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn classify(
    msg: Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Inbound, TransportError>> {
    match msg {
        Ok(WsMessage::Text(text)) => Some(Ok(Inbound::Text(text.to_string()))),
        Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(Inbound::Text(text))),
            Err(_) => {
                debug!(len = bytes.len(), "ignoring non-utf8 binary frame");
                Some(Ok(Inbound::Heartbeat))
            }
        },
        Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => Some(Ok(Inbound::Heartbeat)),
        Ok(WsMessage::Close(frame)) => {
            let reason = frame.map_or_else(|| "no reason".to_string(), |f| f.reason.to_string());
            Some(Err(TransportError::Socket(format!("server closed: {reason}"))))
        }
        Ok(WsMessage::Frame(_)) => None,
        Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
    }
}
