use std::sync::Arc;
use std::time::Duration;

use relay_core::{CacheKey, FetchError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

/// One cached key with its freshness metadata.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Key this entry belongs to.
    pub key: CacheKey,
    /// Latest value, `None` until the first write.
    pub value: Option<Arc<Value>>,
    /// Timestamp of the write that produced `value`.
    pub last_updated_at: Option<Instant>,
    /// Age after which `value` counts as stale.
    pub stale_time: Duration,
    /// A refetch is outstanding. At most one per key.
    pub in_flight_refetch: bool,
    /// Error of the most recent failed refetch, cleared by the next write.
    pub error: Option<FetchError>,
    /// Explicitly marked stale; cleared by the next write.
    pub invalidated: bool,
    /// Last time a reader looked at this entry.
    pub last_accessed_at: Instant,
    /// When the entry was created.
    pub created_at: Instant,
    pub(crate) revision: u64,
    pub(crate) refetch_started: Option<RefetchStart>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RefetchStart {
    pub(crate) at: Instant,
    pub(crate) revision: u64,
}

impl CacheEntry {
    pub(crate) fn new(key: CacheKey, stale_time: Duration, now: Instant) -> Self {
        Self {
            key,
            value: None,
            last_updated_at: None,
            stale_time,
            in_flight_refetch: false,
            error: None,
            invalidated: false,
            last_accessed_at: now,
            created_at: now,
            revision: 0,
            refetch_started: None,
        }
    }

    /// Number of writes applied so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Staleness at `now` using the entry's own stale time.
    pub fn is_stale_at(&self, now: Instant) -> bool {
        is_stale(self.last_updated_at, self.invalidated, self.stale_time, now)
    }

    /// Store `value` as written at `stamped_at`.
    ///
    /// Returns `false` when the entry already holds a later write.
    pub(crate) fn commit(&mut self, value: Value, stamped_at: Instant) -> bool {
        if self.last_updated_at.is_some_and(|last| stamped_at < last) {
            return false;
        }
        self.value = Some(Arc::new(value));
        self.last_updated_at = Some(stamped_at);
        self.error = None;
        self.invalidated = false;
        self.revision += 1;
        true
    }

    pub(crate) fn view(&self) -> CacheView {
        CacheView {
            value: self.value.clone(),
            last_updated_at: self.last_updated_at,
            stale_time: self.stale_time,
            is_fetching: self.in_flight_refetch,
            error: self.error.clone(),
            invalidated: self.invalidated,
            revision: self.revision,
        }
    }
}

/// Immutable snapshot of an entry as published to readers.
#[derive(Clone, Debug)]
pub struct CacheView {
    /// Latest value, `None` until the first write.
    pub value: Option<Arc<Value>>,
    /// Timestamp of the write that produced `value`.
    pub last_updated_at: Option<Instant>,
    /// Entry stale time.
    pub stale_time: Duration,
    /// A refetch is outstanding.
    pub is_fetching: bool,
    /// Error of the most recent failed refetch.
    pub error: Option<FetchError>,
    /// Explicitly marked stale.
    pub invalidated: bool,
    /// Number of writes applied so far.
    pub revision: u64,
}

impl CacheView {
    /// Stale right now, by the entry's stale time.
    pub fn is_stale(&self) -> bool {
        self.is_stale_for(self.stale_time)
    }

    /// Stale right now, by a caller-chosen stale time.
    pub fn is_stale_for(&self, stale_time: Duration) -> bool {
        is_stale(self.last_updated_at, self.invalidated, stale_time, Instant::now())
    }

    /// Deserialize the value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.value
            .as_deref()
            .map(T::deserialize)
            .transpose()
    }
}

fn is_stale(
    last_updated_at: Option<Instant>,
    invalidated: bool,
    stale_time: Duration,
    now: Instant,
) -> bool {
    match last_updated_at {
        _ if invalidated => true,
        None => true,
        Some(at) => now.saturating_duration_since(at) > stale_time,
    }
}

/// What [`CacheStore::invalidate`](super::CacheStore::invalidate) did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invalidation {
    /// Readers exist; the entry was kept and marked stale.
    MarkedStale,
    /// Nobody was reading; the entry was removed.
    Evicted,
    /// No such entry.
    Missing,
}
