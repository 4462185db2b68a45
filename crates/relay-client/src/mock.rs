//! Scriptable in-memory connector and fetcher for deterministic tests.
//!
//! [`MockConnector`] hands out [`MockLink`]s: every successful dial creates a
//! link whose outbound frames are recorded and whose inbound side the test
//! drives. Dials can be scripted to fail or stall. [`MockFetcher`] answers
//! refetches from per-key responses and counts calls.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Sink;
use parking_lot::Mutex;
use relay_core::{CacheKey, ClientFrame, FetchError, TransportError};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::fetcher::Fetcher;
use crate::transport::{Connector, FrameSink, FrameStream, Inbound};

#[derive(Clone, Copy, Debug)]
enum DialScript {
    Fail,
    Stall,
}

#[derive(Default)]
struct ConnectorState {
    script: VecDeque<DialScript>,
    dial_times: Vec<Instant>,
    links: Vec<MockLink>,
}

/// Connector producing in-memory links.
pub struct MockConnector {
    state: Mutex<ConnectorState>,
    links_tx: watch::Sender<usize>,
}

impl MockConnector {
    /// New connector whose dials succeed unless scripted otherwise.
    pub fn new() -> Arc<Self> {
        let (links_tx, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(ConnectorState::default()),
            links_tx,
        })
    }

    /// Make the next `n` dials fail with a connect error.
    pub fn fail_next(&self, n: usize) {
        self.state
            .lock()
            .script
            .extend(std::iter::repeat_n(DialScript::Fail, n));
    }

    /// Make the next `n` dials hang until the connect timeout fires.
    pub fn stall_next(&self, n: usize) {
        self.state
            .lock()
            .script
            .extend(std::iter::repeat_n(DialScript::Stall, n));
    }

    /// Number of dials so far, successful or not.
    pub fn dial_count(&self) -> usize {
        self.state.lock().dial_times.len()
    }

    /// When each dial started.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.state.lock().dial_times.clone()
    }

    /// Every link handed out so far, oldest first.
    pub fn links(&self) -> Vec<MockLink> {
        self.state.lock().links.clone()
    }

    /// Wait until the zero-based `index`-th successful link exists.
    pub async fn wait_for_link(&self, index: usize) -> MockLink {
        let mut rx = self.links_tx.subscribe();
        let _ = rx.wait_for(|count| *count > index).await;
        self.state.lock().links[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
        let script = {
            let mut state = self.state.lock();
            state.dial_times.push(Instant::now());
            state.script.pop_front()
        };
        match script {
            Some(DialScript::Fail) => {
                return Err(TransportError::Connect("connection refused".into()));
            }
            Some(DialScript::Stall) => std::future::pending::<()>().await,
            None => {}
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let link = MockLink {
            sent: Arc::new(Mutex::new(Vec::new())),
            write_failure: Arc::new(Mutex::new(None)),
            inbound_tx,
        };

        let frame_sink = MockSink {
            sent: Arc::clone(&link.sent),
            write_failure: Arc::clone(&link.write_failure),
            guard: link.inbound_tx.clone(),
        };
        let stream = UnboundedReceiverStream::new(inbound_rx);

        let count = {
            let mut state = self.state.lock();
            state.links.push(link);
            state.links.len()
        };
        self.links_tx.send_replace(count);

        Ok((Box::pin(frame_sink), Box::pin(stream)))
    }
}

/// Client half of a link. Stays usable after a failed write.
struct MockSink {
    sent: Arc<Mutex<Vec<String>>>,
    write_failure: Arc<Mutex<Option<TransportError>>>,
    guard: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
}

impl Sink<String> for MockSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, text: String) -> Result<(), Self::Error> {
        if self.guard.is_closed() {
            return Err(TransportError::Socket("link closed".into()));
        }
        if let Some(err) = self.write_failure.lock().take() {
            return Err(err);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Server side of one in-memory link.
#[derive(Clone)]
pub struct MockLink {
    sent: Arc<Mutex<Vec<String>>>,
    write_failure: Arc<Mutex<Option<TransportError>>>,
    inbound_tx: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
}

impl MockLink {
    /// Raw frames the client wrote, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Control frames the client wrote, in order.
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Push a text frame to the client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.inbound_tx.send(Ok(Inbound::Text(text.into())));
    }

    /// Push a JSON frame to the client.
    pub fn push_json(&self, value: &Value) {
        self.push(value.to_string());
    }

    /// Deliver liveness traffic.
    pub fn heartbeat(&self) {
        let _ = self.inbound_tx.send(Ok(Inbound::Heartbeat));
    }

    /// Fail the client's next write on this link with `err`.
    pub fn fail_next_write(&self, err: TransportError) {
        *self.write_failure.lock() = Some(err);
    }

    /// Kill the link as if the socket errored.
    pub fn drop_connection(&self) {
        let _ = self
            .inbound_tx
            .send(Err(TransportError::Socket("connection reset".into())));
    }

    /// Whether the client still reads from this link.
    pub fn is_open(&self) -> bool {
        !self.inbound_tx.is_closed()
    }
}

/// Fetcher answering from scripted per-key responses.
#[derive(Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<CacheKey, Result<Value, FetchError>>>,
    queued: Mutex<HashMap<CacheKey, VecDeque<Result<Value, FetchError>>>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<CacheKey>>,
    call_count: AtomicUsize,
}

impl MockFetcher {
    /// Fetcher with no responses; unknown keys yield a 404.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every fetch of `key` with `result`.
    pub fn respond(&self, key: impl Into<CacheKey>, result: Result<Value, FetchError>) {
        let _ = self.responses.lock().insert(key.into(), result);
    }

    /// Answer the next fetch of `key` with `result`, ahead of [`respond`](Self::respond).
    pub fn enqueue(&self, key: impl Into<CacheKey>, result: Result<Value, FetchError>) {
        self.queued
            .lock()
            .entry(key.into())
            .or_default()
            .push_back(result);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Total fetches issued.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Fetches issued for `key`.
    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|k| k.as_str() == key).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, FetchError> {
        let _ = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(key.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        self.responses
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::from_status(404, "not found")))
    }
}
