//! Freshness-aware key/value cache.
//!
//! Each key lives in a [`DashMap`] slot together with a `watch` sender.
//! Every mutation runs under the slot's shard lock and republishes the
//! entry's [`CacheView`] before the lock is released, so readers never
//! observe a write without its notification or two writes out of order.
//!
//! Never hold a `watch::Ref` from [`CacheStore::watch`] while calling back
//! into the store on the same key.

mod entry;

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use relay_core::{CacheKey, FetchError, MessageKind};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use entry::{CacheEntry, CacheView, Invalidation};
use entry::RefetchStart;

struct Slot {
    entry: CacheEntry,
    tx: watch::Sender<CacheView>,
}

impl Slot {
    fn new(key: CacheKey, stale_time: Duration, now: Instant) -> Self {
        let entry = CacheEntry::new(key, stale_time, now);
        let (tx, _) = watch::channel(entry.view());
        Self { entry, tx }
    }

    fn publish(&self) {
        let _ = self.tx.send_replace(self.entry.view());
    }

    fn has_readers(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    fn is_collectable(&self, now: Instant, gc_time: Duration) -> bool {
        !self.has_readers()
            && !self.entry.in_flight_refetch
            && now.saturating_duration_since(self.entry.last_accessed_at) >= gc_time
    }
}

/// Process-lifetime cache of channel-fed and refetched values.
pub struct CacheStore {
    slots: DashMap<CacheKey, Slot>,
    default_stale_time: Duration,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.slots.len())
            .field("default_stale_time", &self.default_stale_time)
            .finish()
    }
}

impl CacheStore {
    /// Empty store; new entries get `default_stale_time`.
    pub fn new(default_stale_time: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            default_stale_time,
        }
    }

    /// Stale time given to new entries.
    pub fn default_stale_time(&self) -> Duration {
        self.default_stale_time
    }

    /// Copy of the entry. No side effects.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Current view of the entry. No side effects.
    pub fn view(&self, key: &CacheKey) -> Option<CacheView> {
        self.slots.get(key).map(|slot| slot.entry.view())
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live receivers registered for `key`.
    pub fn reader_count(&self, key: &CacheKey) -> usize {
        self.slots.get(key).map_or(0, |slot| slot.tx.receiver_count())
    }

    /// Register a reader, creating the entry if needed.
    ///
    /// An entry with a live receiver is never evicted.
    pub fn watch(&self, key: &CacheKey) -> watch::Receiver<CacheView> {
        let now = Instant::now();
        let mut slot = self.slot_mut(key, now);
        slot.entry.last_accessed_at = now;
        slot.tx.subscribe()
    }

    /// Record a read for garbage-collection purposes.
    pub fn touch(&self, key: &CacheKey) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.entry.last_accessed_at = Instant::now();
        }
    }

    /// Write `value` as the key's new value.
    ///
    /// For [`MessageKind::Delta`] the caller passes the already merged value.
    pub fn set(&self, key: &CacheKey, value: Value, kind: MessageKind) {
        self.set_with(key, kind, move |_| value);
    }

    /// Compute and write the key's new value from its current one, atomically
    /// with respect to other writers of the same key.
    pub fn set_with<F>(&self, key: &CacheKey, kind: MessageKind, f: F)
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let now = Instant::now();
        let mut slot = self.slot_mut(key, now);
        let next = f(slot.entry.value.as_deref());
        if slot.entry.commit(next, now) {
            slot.publish();
            trace!(key = %key, ?kind, revision = slot.entry.revision(), "cache write");
        } else {
            debug!(key = %key, ?kind, "discarding out-of-date write");
        }
    }

    /// Stale by the entry's own stale time. Absent keys are stale.
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.slots
            .get(key)
            .is_none_or(|slot| slot.entry.is_stale_at(Instant::now()))
    }

    /// Claim the refetch slot for `key`, creating the entry if needed.
    ///
    /// Returns `false` if a refetch is already in flight.
    pub fn begin_refetch(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let mut slot = self.slot_mut(key, now);
        if slot.entry.in_flight_refetch {
            return false;
        }
        slot.entry.in_flight_refetch = true;
        slot.entry.refetch_started = Some(RefetchStart {
            at: now,
            revision: slot.entry.revision(),
        });
        slot.publish();
        true
    }

    /// Release the refetch slot and record its outcome.
    ///
    /// A successful result is stamped at the refetch start and dropped when
    /// any other write landed while the request was in flight. A failure keeps
    /// the previous value and records the error. Returns the resulting view,
    /// or `None` if the entry was evicted meanwhile.
    pub fn end_refetch(&self, key: &CacheKey, result: Result<Value, FetchError>) -> Option<CacheView> {
        let Some(mut slot) = self.slots.get_mut(key) else {
            debug!(key = %key, "refetch finished for evicted entry");
            return None;
        };
        if !slot.entry.in_flight_refetch {
            debug!(key = %key, "ignoring refetch completion with no refetch in flight");
            return Some(slot.entry.view());
        }
        slot.entry.in_flight_refetch = false;
        let started = slot.entry.refetch_started.take();

        match result {
            Ok(value) => {
                let stamp = started.map_or_else(Instant::now, |s| s.at);
                let superseded = started.is_some_and(|s| s.revision != slot.entry.revision());
                if superseded {
                    debug!(key = %key, "refetch result superseded by a newer write");
                } else {
                    let _ = slot.entry.commit(value, stamp);
                }
            }
            Err(err) => {
                debug!(key = %key, error = %err, kind = err.error_kind(), "refetch failed");
                slot.entry.error = Some(err);
            }
        }

        slot.publish();
        Some(slot.entry.view())
    }

    /// Mark `key` stale if it has readers or a refetch in flight, otherwise
    /// remove it.
    ///
    /// An in-flight entry is kept so its refetch stays the only one until
    /// [`CacheStore::end_refetch`] settles it.
    pub fn invalidate(&self, key: &CacheKey) -> Invalidation {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let keep = occupied.get().has_readers() || occupied.get().entry.in_flight_refetch;
                if keep {
                    let slot = occupied.get_mut();
                    slot.entry.invalidated = true;
                    slot.publish();
                    Invalidation::MarkedStale
                } else {
                    let _ = occupied.remove();
                    Invalidation::Evicted
                }
            }
            Entry::Vacant(_) => Invalidation::Missing,
        }
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|slot| slot.key().as_str().starts_with(prefix))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Evict entries with no readers, no refetch in flight, and no access for
    /// at least `gc_time`. Returns how many were removed.
    pub fn collect_garbage(&self, gc_time: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.slots.retain(|key, slot| {
            let collect = slot.is_collectable(now, gc_time);
            if collect {
                trace!(key = %key, "evicting idle entry");
                evicted += 1;
            }
            !collect
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.slots.len(), "cache garbage collected");
        }
        evicted
    }

    fn slot_mut(&self, key: &CacheKey, now: Instant) -> RefMut<'_, CacheKey, Slot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), self.default_stale_time, now))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn store() -> CacheStore {
        CacheStore::new(Duration::from_secs(30))
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    #[tokio::test(start_paused = true)]
    async fn get_is_pure() {
        let s = store();
        assert!(s.get(&key("shards")).is_none());
        assert!(s.is_empty());
        assert!(s.is_stale(&key("shards")));
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get() {
        let s = store();
        s.set(&key("shards"), json!({"load": 10}), MessageKind::Snapshot);
        let entry = s.get(&key("shards")).unwrap();
        assert_eq!(entry.value.as_deref(), Some(&json!({"load": 10})));
        assert!(entry.last_updated_at.is_some());
        assert!(!s.is_stale(&key("shards")));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_after_window() {
        let s = store();
        s.set(&key("k"), json!(1), MessageKind::Snapshot);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(s.is_stale(&key("k")));
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_notified_on_every_write() {
        let s = store();
        let mut rx = s.watch(&key("k"));
        assert!(rx.borrow_and_update().value.is_none());

        s.set(&key("k"), json!(1), MessageKind::Snapshot);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().value.as_deref(), Some(&json!(1)));

        s.set_with(&key("k"), MessageKind::Delta, |v| {
            json!(v.and_then(Value::as_i64).unwrap_or(0) + 1)
        });
        assert_eq!(rx.borrow_and_update().value.as_deref(), Some(&json!(2)));
        assert_eq!(rx.borrow().revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_refetch_is_exclusive() {
        let s = store();
        assert!(s.begin_refetch(&key("votes")));
        assert!(!s.begin_refetch(&key("votes")));
        assert!(s.get(&key("votes")).unwrap().in_flight_refetch);

        let _ = s.end_refetch(&key("votes"), Ok(json!({"yes": 1})));
        assert!(!s.get(&key("votes")).unwrap().in_flight_refetch);
        assert!(s.begin_refetch(&key("votes")));
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_error_keeps_value() {
        let s = store();
        s.set(&key("votes"), json!({"yes": 1}), MessageKind::Snapshot);
        assert!(s.begin_refetch(&key("votes")));
        let view = s
            .end_refetch(&key("votes"), Err(FetchError::from_status(503, "busy")))
            .unwrap();
        assert_eq!(view.value.as_deref(), Some(&json!({"yes": 1})));
        assert_matches!(view.error, Some(FetchError::Status { status: 503, .. }));
        assert!(!view.is_fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_after_failed_refetch_clears_error() {
        let s = store();
        assert!(s.begin_refetch(&key("votes")));
        let _ = s.end_refetch(&key("votes"), Err(FetchError::Timeout));
        assert!(s.get(&key("votes")).unwrap().error.is_some());

        tokio::time::advance(Duration::from_millis(5)).await;
        s.set(&key("votes"), json!({"yes": 7}), MessageKind::Snapshot);
        let entry = s.get(&key("votes")).unwrap();
        assert_eq!(entry.value.as_deref(), Some(&json!({"yes": 7})));
        assert!(entry.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn push_during_refetch_wins() {
        let s = store();
        assert!(s.begin_refetch(&key("blocks")));
        tokio::time::advance(Duration::from_millis(100)).await;
        s.set(&key("blocks"), json!({"height": 101}), MessageKind::Snapshot);
        tokio::time::advance(Duration::from_millis(100)).await;

        let view = s.end_refetch(&key("blocks"), Ok(json!({"height": 100}))).unwrap();
        assert_eq!(view.value.as_deref(), Some(&json!({"height": 101})));
        assert!(view.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_result_stamped_at_start() {
        let s = store();
        let started = Instant::now();
        assert!(s.begin_refetch(&key("k")));
        tokio::time::advance(Duration::from_secs(2)).await;
        let _ = s.end_refetch(&key("k"), Ok(json!(1)));
        assert_eq!(s.get(&key("k")).unwrap().last_updated_at, Some(started));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_keeps_in_flight_entry() {
        let s = store();
        assert!(s.begin_refetch(&key("k")));
        assert_eq!(s.invalidate(&key("k")), Invalidation::MarkedStale);
        assert!(s.contains(&key("k")));
        assert!(s.get(&key("k")).unwrap().in_flight_refetch);
        assert!(!s.begin_refetch(&key("k")));

        let view = s.end_refetch(&key("k"), Ok(json!(1))).unwrap();
        assert_eq!(view.value.as_deref(), Some(&json!(1)));
        assert!(!view.is_fetching);
        assert!(s.begin_refetch(&key("k")));
        assert!(!s.begin_refetch(&key("k")));
    }

    #[tokio::test(start_paused = true)]
    async fn stray_end_refetch_leaves_entry_alone() {
        let s = store();
        assert!(s.end_refetch(&key("k"), Ok(json!(1))).is_none());

        s.set(&key("k"), json!(1), MessageKind::Snapshot);
        let view = s.end_refetch(&key("k"), Err(FetchError::Timeout)).unwrap();
        assert_eq!(view.value.as_deref(), Some(&json!(1)));
        assert!(view.error.is_none());
        assert_eq!(view.revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_after_refetch_settles_evicts() {
        let s = store();
        assert!(s.begin_refetch(&key("k")));
        let _ = s.end_refetch(&key("k"), Ok(json!(1)));
        assert_eq!(s.invalidate(&key("k")), Invalidation::Evicted);
        assert!(!s.contains(&key("k")));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_with_reader_keeps_value() {
        let s = store();
        let rx = s.watch(&key("k"));
        s.set(&key("k"), json!(1), MessageKind::Snapshot);

        assert_eq!(s.invalidate(&key("k")), Invalidation::MarkedStale);
        assert!(s.is_stale(&key("k")));
        let view = rx.borrow().clone();
        assert!(view.invalidated);
        assert_eq!(view.value.as_deref(), Some(&json!(1)));

        s.set(&key("k"), json!(2), MessageKind::Snapshot);
        assert!(!s.is_stale(&key("k")));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_without_reader_evicts() {
        let s = store();
        s.set(&key("k"), json!(1), MessageKind::Snapshot);
        assert_eq!(s.invalidate(&key("k")), Invalidation::Evicted);
        assert!(s.get(&key("k")).is_none());
        assert_eq!(s.invalidate(&key("k")), Invalidation::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_listing() {
        let s = store();
        for k in ["/api/shards", "/api/shards/3", "/api/votes", "blocks"] {
            s.set(&key(k), json!(null), MessageKind::Snapshot);
        }
        assert_eq!(
            s.keys_with_prefix("/api/shards"),
            vec![key("/api/shards"), key("/api/shards/3")]
        );
        assert_eq!(s.keys_with_prefix("").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_spares_read_fetching_and_recent_entries() {
        let s = Arc::new(store());
        s.set(&key("idle"), json!(1), MessageKind::Snapshot);
        s.set(&key("recent"), json!(1), MessageKind::Snapshot);
        let _reader = s.watch(&key("watched"));
        assert!(s.begin_refetch(&key("fetching")));

        tokio::time::advance(Duration::from_secs(240)).await;
        s.touch(&key("recent"));
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(s.collect_garbage(Duration::from_secs(300)), 1);
        assert!(!s.contains(&key("idle")));
        assert!(s.contains(&key("recent")));
        assert!(s.contains(&key("watched")));
        assert!(s.contains(&key("fetching")));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_collects_after_last_reader_leaves() {
        let s = store();
        let reader = s.watch(&key("k"));
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(s.collect_garbage(Duration::from_secs(300)), 0);
        drop(reader);
        assert_eq!(s.collect_garbage(Duration::from_secs(300)), 1);
    }
}
