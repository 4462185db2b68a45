//! Consumer API.
//!
//! [`LiveClient`] wires one [`Transport`], one [`Multiplexer`] and one
//! [`CacheStore`] together. Views hold [`LiveQuery`] handles: each keeps its
//! channel announced and its cache entry alive until dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{CacheKey, Channel, DeepMerge, FetchError, MergeRule, SubscriberId};
use relay_settings::{CacheSettings, RelaySettings};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, CacheView, Invalidation};
use crate::classifier::{EventNameClassifier, MessageClassifier};
use crate::error::RelayError;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::multiplexer::{ChannelLease, Multiplexer};
use crate::reconciler::Reconciler;
use crate::transport::{ConnectionState, Connector, Transport, TransportConfig, WsConnector};

/// Per-query overrides of the client defaults.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Age after which the query reports stale. Defaults to the cache setting.
    pub stale_time: Option<Duration>,
    /// Refetch on this period while the query is alive.
    pub refetch_interval: Option<Duration>,
    /// Refetch in the background when subscribing to a stale key.
    pub refetch_on_subscribe: Option<bool>,
}

impl QueryOptions {
    /// Override the stale time.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Poll with the given period.
    #[must_use]
    pub fn refetch_interval(mut self, every: Duration) -> Self {
        self.refetch_interval = Some(every);
        self
    }

    /// Enable or disable the refetch on subscribe.
    #[must_use]
    pub fn refetch_on_subscribe(mut self, enabled: bool) -> Self {
        self.refetch_on_subscribe = Some(enabled);
        self
    }
}

/// Builder for [`LiveClient`].
pub struct LiveClientBuilder {
    settings: RelaySettings,
    connector: Option<Arc<dyn Connector>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    classifier: Option<Arc<dyn MessageClassifier>>,
    merge_rule: Option<Arc<dyn MergeRule>>,
}

impl LiveClientBuilder {
    /// Use `connector` instead of a WebSocket to `connection.url`.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use `fetcher` instead of HTTP against `http.baseUrl`.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Use `classifier` instead of [`EventNameClassifier`].
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn MessageClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Use `merge_rule` instead of [`DeepMerge`] for deltas.
    #[must_use]
    pub fn merge_rule(mut self, merge_rule: Arc<dyn MergeRule>) -> Self {
        self.merge_rule = Some(merge_rule);
        self
    }

    /// Build the client and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime. Nothing is dialed until the
    /// first subscription or [`LiveClient::connect`].
    pub fn build(self) -> Result<LiveClient, RelayError> {
        let settings = self.settings;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(settings.connection.url.clone())));
        let fetcher: Option<Arc<dyn Fetcher>> = match (self.fetcher, &settings.http.base_url) {
            (Some(fetcher), _) => Some(fetcher),
            (None, Some(base_url)) => Some(Arc::new(HttpFetcher::new(
                base_url.clone(),
                settings.http.timeout(),
            )?)),
            (None, None) => None,
        };
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(EventNameClassifier::new()));
        let merge_rule = self.merge_rule.unwrap_or_else(|| Arc::new(DeepMerge));

        let store = Arc::new(CacheStore::new(settings.cache.stale_time()));
        let transport = Transport::new(connector, TransportConfig::from_settings(&settings.connection));
        let mux = Multiplexer::new(
            transport.clone(),
            Reconciler::new(Arc::clone(&store), merge_rule),
            classifier,
        );
        let gc_task = spawn_gc(&store, &settings.cache);

        info!(
            url = %settings.connection.url,
            refetch = fetcher.is_some(),
            "live client ready"
        );

        Ok(LiveClient {
            inner: Arc::new(ClientInner {
                transport,
                mux,
                store,
                fetcher,
                cache: settings.cache,
                gc_task: Mutex::new(Some(gc_task)),
            }),
        })
    }
}

struct ClientInner {
    transport: Transport,
    mux: Arc<Multiplexer>,
    store: Arc<CacheStore>,
    fetcher: Option<Arc<dyn Fetcher>>,
    cache: CacheSettings,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn stop_background(&self) {
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.stop_background();
        self.transport.close();
    }
}

/// Live subscription and cache client. Cheap to clone.
#[derive(Clone)]
pub struct LiveClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClient")
            .field("state", &self.connection_state())
            .field("entries", &self.inner.store.len())
            .finish_non_exhaustive()
    }
}

impl LiveClient {
    /// Start building a client from loaded settings.
    pub fn builder(settings: RelaySettings) -> LiveClientBuilder {
        LiveClientBuilder {
            settings,
            connector: None,
            fetcher: None,
            classifier: None,
            merge_rule: None,
        }
    }

    /// Client with the default WebSocket connector and HTTP fetcher.
    pub fn new(settings: RelaySettings) -> Result<Self, RelayError> {
        Self::builder(settings).build()
    }

    /// Start connecting without waiting for a subscription.
    pub fn connect(&self) -> Result<(), RelayError> {
        Ok(self.inner.transport.connect()?)
    }

    /// Subscribe to `key` fed by `channel`, with default options.
    pub fn subscribe(
        &self,
        channel: impl Into<Channel>,
        key: impl Into<CacheKey>,
    ) -> Result<LiveQuery, RelayError> {
        self.subscribe_with(channel, key, QueryOptions::default())
    }

    /// Subscribe to `key` fed by `channel`.
    pub fn subscribe_with(
        &self,
        channel: impl Into<Channel>,
        key: impl Into<CacheKey>,
        options: QueryOptions,
    ) -> Result<LiveQuery, RelayError> {
        self.ensure_open()?;
        let channel = channel.into();
        let key = key.into();
        let stale_time = options
            .stale_time
            .unwrap_or_else(|| self.inner.store.default_stale_time());

        let rx = self.inner.store.watch(&key);
        let lease = self.inner.mux.subscribe(channel.clone(), SubscriberId::new())?;

        let refetch_on_subscribe = options
            .refetch_on_subscribe
            .unwrap_or(self.inner.cache.refetch_on_subscribe);
        let stale = rx.borrow().is_stale_for(stale_time);
        if refetch_on_subscribe && stale && self.inner.fetcher.is_some() {
            self.spawn_refetch(key.clone());
        }

        let poller = match (options.refetch_interval, &self.inner.fetcher) {
            (Some(every), Some(_)) if !every.is_zero() => Some(self.spawn_poller(key.clone(), every)),
            (Some(_), None) => {
                warn!(key = %key, "refetch interval ignored, no fetcher configured");
                None
            }
            _ => None,
        };

        debug!(channel = %channel, key = %key, "query subscribed");
        Ok(LiveQuery {
            client: self.clone(),
            channel,
            key,
            rx,
            stale_time,
            poller,
            _lease: lease,
        })
    }

    /// Refetch `key` over HTTP.
    ///
    /// Concurrent calls for the same key share one request and resolve with
    /// the same outcome. On failure the previous value stays cached and the
    /// error is recorded on the entry.
    pub async fn refetch(&self, key: impl Into<CacheKey>) -> Result<Arc<Value>, RelayError> {
        let key = key.into();
        self.ensure_open()?;
        let Some(fetcher) = self.inner.fetcher.clone() else {
            return Err(RelayError::NoFetcher(key));
        };

        // Holding a receiver keeps the entry from being evicted meanwhile.
        let mut rx = self.inner.store.watch(&key);
        if self.inner.store.begin_refetch(&key) {
            let store = Arc::clone(&self.inner.store);
            let task_key = key.clone();
            // Runs detached so a cancelled caller cannot strand the in-flight marker.
            drop(tokio::spawn(async move {
                let result = fetcher.fetch(&task_key).await;
                let _ = store.end_refetch(&task_key, result);
            }));
        } else {
            debug!(key = %key, "joining in-flight refetch");
        }

        let view = rx
            .wait_for(|view| !view.is_fetching)
            .await
            .map_err(|_| RelayError::Evicted(key.clone()))?
            .clone();
        match (view.error, view.value) {
            (Some(err), _) => Err(err.into()),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(RelayError::Evicted(key)),
        }
    }

    /// Mark `key` stale.
    ///
    /// With live readers or a refetch in flight the value stays visible and a
    /// background refetch starts (or joins the running one); otherwise the
    /// entry is evicted.
    pub fn invalidate(&self, key: impl Into<CacheKey>) -> Invalidation {
        let key = key.into();
        let outcome = self.inner.store.invalidate(&key);
        debug!(key = %key, ?outcome, "invalidated");
        if outcome == Invalidation::MarkedStale && self.inner.fetcher.is_some() && !self.is_closed() {
            self.spawn_refetch(key);
        }
        outcome
    }

    /// Invalidate every key starting with `prefix`. Returns how many matched.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys = self.inner.store.keys_with_prefix(prefix);
        for key in &keys {
            let _ = self.invalidate(key.clone());
        }
        keys.len()
    }

    /// Current view of `key`, if cached.
    pub fn get(&self, key: &CacheKey) -> Option<CacheView> {
        self.inner.store.view(key)
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    /// The channel multiplexer.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.inner.mux
    }

    /// Current connectivity.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Subscribe to connectivity changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.watch_state()
    }

    /// Close the connection and stop background work. Existing queries keep
    /// their last values; new subscriptions and refetches fail.
    pub fn close(&self) {
        info!("closing live client");
        self.inner.stop_background();
        self.inner.transport.close();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }

    fn ensure_open(&self) -> Result<(), RelayError> {
        if self.is_closed() {
            Err(RelayError::Closed)
        } else {
            Ok(())
        }
    }

    fn spawn_refetch(&self, key: CacheKey) {
        let client = self.clone();
        drop(tokio::spawn(async move {
            if let Err(err) = client.refetch(key.clone()).await {
                debug!(key = %key, error = %err, "background refetch failed");
            }
        }));
    }

    fn spawn_poller(&self, key: CacheKey, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let _ = ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let client = LiveClient { inner };
                if client.is_closed() {
                    break;
                }
                if let Err(err) = client.refetch(key.clone()).await {
                    debug!(key = %key, error = %err, "poll refetch failed");
                }
            }
        })
    }
}

fn spawn_gc(store: &Arc<CacheStore>, cache: &CacheSettings) -> JoinHandle<()> {
    let weak = Arc::downgrade(store);
    let every = cache.gc_interval();
    let gc_time = cache.gc_time();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let _ = ticker.tick().await;
            let Some(store) = weak.upgrade() else { break };
            let _ = store.collect_garbage(gc_time);
        }
    })
}

/// One consumer's subscription to a cache key.
///
/// Dropping the query releases its channel interest and stops its poller.
pub struct LiveQuery {
    client: LiveClient,
    channel: Channel,
    key: CacheKey,
    rx: watch::Receiver<CacheView>,
    stale_time: Duration,
    poller: Option<JoinHandle<()>>,
    _lease: ChannelLease,
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("channel", &self.channel)
            .field("key", &self.key)
            .field("stale_time", &self.stale_time)
            .finish_non_exhaustive()
    }
}

impl LiveQuery {
    /// Cache key this query reads.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Channel feeding this query.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Stale time this query judges freshness by.
    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    /// Current snapshot of the entry.
    pub fn view(&self) -> CacheView {
        let view = self.rx.borrow().clone();
        self.client.inner.store.touch(&self.key);
        view
    }

    /// Current value, if any arrived yet.
    pub fn value(&self) -> Option<Arc<Value>> {
        self.view().value
    }

    /// Current value deserialized into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.view().value_as()
    }

    /// Whether the value is older than this query's stale time, missing, or
    /// invalidated.
    pub fn is_stale(&self) -> bool {
        self.rx.borrow().is_stale_for(self.stale_time)
    }

    /// Error of the most recent failed refetch, until the next write.
    pub fn error(&self) -> Option<FetchError> {
        self.rx.borrow().error.clone()
    }

    /// Whether a refetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.rx.borrow().is_fetching
    }

    /// Wait for the next change and return the new view.
    pub async fn changed(&mut self) -> Result<CacheView, RelayError> {
        self.rx
            .changed()
            .await
            .map_err(|_| RelayError::Evicted(self.key.clone()))?;
        Ok(self.view())
    }

    /// Refetch this query's key.
    pub async fn refetch(&self) -> Result<Arc<Value>, RelayError> {
        self.client.refetch(self.key.clone()).await
    }

    /// Release the subscription now. Equivalent to dropping the query.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}
