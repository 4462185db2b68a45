//! Applies channel messages to the cache.
//!
//! Frames reach the reconciler one at a time from the transport task and each
//! write completes under the key's lock before the next frame is read, so
//! writes to one key land in arrival order.
//!
//! A delta for a key with no value yet merges against the rule's baseline
//! (an empty object for [`DeepMerge`]).

use std::sync::Arc;

use relay_core::{CacheKey, Channel, DeepMerge, Message, MessageKind, MergeRule};
use serde_json::Value;
use tracing::trace;

use crate::cache::CacheStore;

/// Routes [`Message`]s into a [`CacheStore`].
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<CacheStore>,
    merge: Arc<dyn MergeRule>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler using `merge` for deltas.
    pub fn new(store: Arc<CacheStore>, merge: Arc<dyn MergeRule>) -> Self {
        Self { store, merge }
    }

    /// Reconciler using [`DeepMerge`].
    pub fn with_deep_merge(store: Arc<CacheStore>) -> Self {
        Self::new(store, Arc::new(DeepMerge))
    }

    /// Store the reconciler writes into.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Replace the key's value.
    pub fn apply_snapshot(&self, channel: &Channel, key: &CacheKey, value: Value) {
        trace!(channel = %channel, key = %key, "apply snapshot");
        self.store.set(key, value, MessageKind::Snapshot);
    }

    /// Merge `patch` into the key's value.
    pub fn apply_delta(&self, channel: &Channel, key: &CacheKey, patch: Value) {
        trace!(channel = %channel, key = %key, "apply delta");
        let merge = &self.merge;
        self.store.set_with(key, MessageKind::Delta, |current| {
            let base = current.cloned().unwrap_or_else(|| merge.baseline());
            merge.merge(base, patch)
        });
    }

    /// Apply either kind of message.
    pub fn apply(&self, message: Message) {
        match message {
            Message::Snapshot {
                channel,
                key,
                value,
            } => self.apply_snapshot(&channel, &key, value),
            Message::Delta {
                channel,
                key,
                patch,
            } => self.apply_delta(&channel, &key, patch),
        }
    }
}
