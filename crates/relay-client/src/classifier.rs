//! Snapshot/delta classification of inbound frames.
//!
//! Which events carry deltas is a per-channel convention agreed with the
//! server, so the multiplexer asks a [`MessageClassifier`] instead of
//! inspecting payload shapes.

use std::collections::HashMap;

use relay_core::{Channel, MessageKind, ServerFrame};

/// Decides whether a frame replaces or patches its cache key.
pub trait MessageClassifier: Send + Sync {
    /// Kind of `frame`.
    fn classify(&self, frame: &ServerFrame) -> MessageKind;
}

/// Classifies by event name, with per-channel and per-event overrides.
///
/// Without overrides an event named `delta`, or ending in `_delta`, `.delta`
/// or `:delta`, is a delta. Everything else is a snapshot.
#[derive(Clone, Debug, Default)]
pub struct EventNameClassifier {
    channels: HashMap<Channel, MessageKind>,
    events: HashMap<String, MessageKind>,
}

impl EventNameClassifier {
    /// Classifier with only the naming convention.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat every frame on `channel` as `kind`.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<Channel>, kind: MessageKind) -> Self {
        let _ = self.channels.insert(channel.into(), kind);
        self
    }

    /// Treat every frame whose event is `event` as `kind`.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>, kind: MessageKind) -> Self {
        let _ = self.events.insert(event.into(), kind);
        self
    }
}

impl MessageClassifier for EventNameClassifier {
    fn classify(&self, frame: &ServerFrame) -> MessageKind {
        if let Some(kind) = self.events.get(&frame.event) {
            return *kind;
        }
        if let Some(kind) = frame.channel.as_ref().and_then(|c| self.channels.get(c)) {
            return *kind;
        }
        if is_delta_event(&frame.event) {
            MessageKind::Delta
        } else {
            MessageKind::Snapshot
        }
    }
}

fn is_delta_event(event: &str) -> bool {
    const SUFFIXES: [&str; 3] = ["_delta", ".delta", ":delta"];
    event == "delta" || SUFFIXES.iter().any(|suffix| event.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn frame(event: &str, channel: &str) -> ServerFrame {
        ServerFrame {
            event: event.to_string(),
            channel: Some(channel.into()),
            key: Some("k".into()),
            payload: Value::Null,
        }
    }

    #[test]
    fn naming_convention() {
        let c = EventNameClassifier::new();
        assert_eq!(c.classify(&frame("delta", "a")), MessageKind::Delta);
        assert_eq!(c.classify(&frame("shard_delta", "a")), MessageKind::Delta);
        assert_eq!(c.classify(&frame("shard.delta", "a")), MessageKind::Delta);
        assert_eq!(c.classify(&frame("shard:delta", "a")), MessageKind::Delta);
        assert_eq!(c.classify(&frame("shard_update", "a")), MessageKind::Snapshot);
        assert_eq!(c.classify(&frame("deltas", "a")), MessageKind::Snapshot);
    }

    #[test]
    fn channel_override() {
        let c = EventNameClassifier::new().with_channel("votes", MessageKind::Delta);
        assert_eq!(c.classify(&frame("tally", "votes")), MessageKind::Delta);
        assert_eq!(c.classify(&frame("tally", "blocks")), MessageKind::Snapshot);
    }

    #[test]
    fn event_override_beats_channel_override() {
        let c = EventNameClassifier::new()
            .with_channel("votes", MessageKind::Delta)
            .with_event("votes_reset", MessageKind::Snapshot);
        assert_eq!(c.classify(&frame("votes_reset", "votes")), MessageKind::Snapshot);
        assert_eq!(c.classify(&frame("tally", "votes")), MessageKind::Delta);
    }
}
