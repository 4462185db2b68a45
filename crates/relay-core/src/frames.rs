//! Wire frames and the reconciler's message union.
//!
//! Client → server frames are tagged by `type`:
//! `{"type":"subscribe","channel":"shards"}`.
//!
//! Server → client frames carry a channel-specific event name, the channel,
//! the cache key and an opaque payload:
//! `{"type":"shard_update","channel":"shards","key":"/api/shards","payload":{..}}`.
//! Whether a payload replaces or patches the cached value is a per-channel
//! convention, so [`ServerFrame`] stays untyped until it is classified into a
//! [`Message`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{CacheKey, Channel};

/// Control frames written by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving pushes for a channel.
    Subscribe {
        /// Channel to announce.
        channel: Channel,
    },
    /// Stop receiving pushes for a channel.
    Unsubscribe {
        /// Channel to withdraw.
        channel: Channel,
    },
}

impl ClientFrame {
    /// The channel this frame is about.
    pub fn channel(&self) -> &Channel {
        match self {
            Self::Subscribe { channel } | Self::Unsubscribe { channel } => channel,
        }
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A frame pushed by the server, before classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Channel-specific event name.
    #[serde(rename = "type")]
    pub event: String,
    /// Channel the push belongs to. Absent on server acknowledgements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// Cache key the payload applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<CacheKey>,
    /// Opaque business payload.
    #[serde(default)]
    pub payload: Value,
}

impl ServerFrame {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// How a channel event affects the cached value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Full replacement.
    Snapshot,
    /// Partial update merged into the current value.
    Delta,
}

/// A classified push, resolved to exactly one cache key.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Replace the value at `key` wholesale.
    Snapshot {
        /// Source channel.
        channel: Channel,
        /// Target cache key.
        key: CacheKey,
        /// New value.
        value: Value,
    },
    /// Merge `patch` into the value at `key`.
    Delta {
        /// Source channel.
        channel: Channel,
        /// Target cache key.
        key: CacheKey,
        /// Partial update.
        patch: Value,
    },
}

impl Message {
    /// Build a message from a parsed frame once its kind is known.
    pub fn from_frame(frame: ServerFrame, kind: MessageKind) -> Result<Self, ProtocolError> {
        let channel = frame
            .channel
            .ok_or(ProtocolError::MissingChannel(frame.event))?;
        let key = frame
            .key
            .ok_or_else(|| ProtocolError::MissingKey {
                channel: channel.clone(),
            })?;
        Ok(match kind {
            MessageKind::Snapshot => Self::Snapshot {
                channel,
                key,
                value: frame.payload,
            },
            MessageKind::Delta => Self::Delta {
                channel,
                key,
                patch: frame.payload,
            },
        })
    }

    /// Source channel.
    pub fn channel(&self) -> &Channel {
        match self {
            Self::Snapshot { channel, .. } | Self::Delta { channel, .. } => channel,
        }
    }

    /// Target cache key.
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Snapshot { key, .. } | Self::Delta { key, .. } => key,
        }
    }

    /// Snapshot or delta.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Snapshot { .. } => MessageKind::Snapshot,
            Self::Delta { .. } => MessageKind::Delta,
        }
    }
}
