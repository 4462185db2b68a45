//! Error taxonomy.
//!
//! - [`TransportError`]: connection-level failures. Retryable ones drop the
//!   link and are handled by the reconnect loop. [`TransportError::Encode`]
//!   only loses the frame, and [`TransportError::Closed`] is final.
//! - [`ProtocolError`]: inbound frames that cannot be parsed or routed. Logged
//!   and dropped, never surfaced per key.
//! - [`FetchError`]: HTTP refetch failures, recorded on the cache entry.

use thiserror::Error;

use crate::ids::Channel;

/// Failures of the physical connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was closed intentionally; sending is a caller bug.
    #[error("transport closed")]
    Closed,
    /// Opening the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Opening the connection did not finish in time.
    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),
    /// Reading from or writing to an open socket failed.
    #[error("socket error: {0}")]
    Socket(String),
    /// An outbound frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl TransportError {
    /// Whether the link is gone and the reconnect loop should take over.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::ConnectTimeout(_) | Self::Socket(_)
        )
    }

    /// Short classification string for logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connect(_) => "connect",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Socket(_) => "socket",
            Self::Encode(_) => "encode",
        }
    }
}

/// Inbound frames the multiplexer cannot route.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not valid JSON, or not an object with a `type` field.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The frame names a channel but no cache key.
    #[error("frame on channel {channel} has no key")]
    MissingKey {
        /// Channel the frame arrived on.
        channel: Channel,
    },
    /// The frame has no channel, so it cannot resolve to a cache key.
    #[error("frame of type {0} has no channel")]
    MissingChannel(String),
    /// Nobody is subscribed to the channel.
    #[error("no subscribers for channel {0}")]
    UnknownChannel(Channel),
}

/// Failures of an HTTP refetch.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),
    /// The response was not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
    /// The request did not finish in time.
    #[error("request timed out")]
    Timeout,
}

impl FetchError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if body.len() > 512 {
            let mut cut = 512;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Self::Status { status, body }
    }

    /// Short classification string for logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
            Self::Timeout => "timeout",
        }
    }
}
