//! Single shared connection with automatic reconnection.
//!
//! [`Transport`] is a cheap handle to an actor task that owns the socket.
//! Handles talk to the actor over an unbounded command channel, so every
//! method except [`Transport::flush`] is synchronous and non-blocking.
//!
//! The actor keeps the set of channels announced on the current physical
//! link. Subscribe frames for an announced channel and unsubscribe frames for
//! an unannounced one are never written. On every successful (re)connect the
//! set is rebuilt from [`FrameHandler::wanted_channels`], so subscribe and
//! unsubscribe frames issued while offline are dropped rather than queued.
//! Raw frames queued offline are flushed FIFO after the announcement.

mod actor;
pub mod connector;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use relay_core::{BackoffPolicy, Channel, ClientFrame, ServerFrame, TransportError};
use relay_settings::ConnectionSettings;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

pub use connector::{Connector, FrameSink, FrameStream, Inbound, WsConnector};

use self::actor::TransportActor;

/// Connectivity as seen by consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying (before the first connect, or closed).
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Link is up and channels are announced.
    Connected,
    /// Link dropped; waiting out backoff or redialing.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs for the transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Delay schedule between reconnect attempts.
    pub backoff: BackoffPolicy,
    /// Upper bound on a single dial.
    pub connect_timeout: Duration,
    /// Drop the link after this long without inbound traffic.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl TransportConfig {
    /// Build from loaded connection settings.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            backoff: settings.backoff(),
            connect_timeout: settings.connect_timeout(),
            idle_timeout: settings.idle_timeout(),
        }
    }
}

/// Downstream consumer of inbound frames.
pub trait FrameHandler: Send + Sync {
    /// Called for every parsed inbound frame, in arrival order, on the
    /// transport task.
    fn on_frame(&self, frame: ServerFrame);

    /// Channels that must be announced after a (re)connect.
    fn wanted_channels(&self) -> Vec<Channel>;
}

pub(crate) enum Outbound {
    Control(ClientFrame),
    Raw(String),
}

pub(crate) enum TransportCmd {
    Connect,
    Send(Outbound),
    Flush(oneshot::Sender<()>),
    Close,
}

pub(crate) struct Shared {
    handler: RwLock<Option<Weak<dyn FrameHandler>>>,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    pub(crate) fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let _ = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Handle to the shared connection.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Spawn the connection task. Must be called inside a Tokio runtime.
    ///
    /// Nothing is dialed until [`connect`](Self::connect).
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
            state: state_tx,
        });

        let actor = TransportActor::new(connector, config, Arc::clone(&shared), cmd_rx);
        drop(tokio::spawn(actor.run()));

        Self { cmd_tx, shared }
    }

    /// Start connecting. No-op while connecting or connected.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.dispatch(TransportCmd::Connect)
    }

    /// Send a subscribe/unsubscribe frame, or queue it while offline.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.dispatch(TransportCmd::Send(Outbound::Control(frame)))
    }

    /// Send an application frame verbatim. Queued FIFO while offline.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.dispatch(TransportCmd::Send(Outbound::Raw(text.into())))
    }

    /// Resolve once every frame sent before this call was written or queued.
    pub async fn flush(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(TransportCmd::Flush(tx))?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Register the single frame consumer. Held weakly; a new registration
    /// replaces the previous one.
    pub fn on_message<H: FrameHandler + 'static>(&self, handler: &Arc<H>) {
        let weak: Weak<H> = Arc::downgrade(handler);
        let weak: Weak<dyn FrameHandler> = weak;
        *self.shared.handler.write() = Some(weak);
    }

    /// Close for good. Later sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.cmd_tx.send(TransportCmd::Close);
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Current connectivity.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to connectivity changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn dispatch(&self, cmd: TransportCmd) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.cmd_tx.send(cmd).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::mock::MockConnector;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<ServerFrame>>,
        wanted: Mutex<Vec<Channel>>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, frame: ServerFrame) {
            self.frames.lock().push(frame);
        }

        fn wanted_channels(&self) -> Vec<Channel> {
            self.wanted.lock().clone()
        }
    }

    fn config(base_ms: u64, max_ms: u64) -> TransportConfig {
        TransportConfig {
            backoff: BackoffPolicy::fixed_schedule(
                Duration::from_millis(base_ms),
                2.0,
                Duration::from_millis(max_ms),
            ),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }

    async fn wait_state(transport: &Transport, state: ConnectionState) {
        let mut rx = transport.watch_state();
        let _ = rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn starts_disconnected_until_connect() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(connector.dial_count(), 0);

        transport.connect().unwrap();
        wait_state(&transport, ConnectionState::Connected).await;
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        transport.connect().unwrap();
        wait_state(&transport, ConnectionState::Connected).await;
        transport.connect().unwrap();
        transport.flush().await.unwrap();
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn raw_frames_queued_offline_flush_fifo() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.send_raw("one").unwrap();
        transport.send_raw("two").unwrap();
        transport.send_raw("three").unwrap();
        transport.connect().unwrap();

        let link = connector.wait_for_link(0).await;
        transport.flush().await.unwrap();
        assert_eq!(link.sent(), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn announces_wanted_channels_on_connect() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        let recorder = Arc::new(Recorder::default());
        *recorder.wanted.lock() = vec!["votes".into(), "shard-metrics".into()];
        transport.on_message(&recorder);

        // queued control frames are superseded by the announcement
        transport.send(ClientFrame::Subscribe { channel: "votes".into() }).unwrap();
        transport.connect().unwrap();

        let link = connector.wait_for_link(0).await;
        transport.flush().await.unwrap();
        assert_eq!(
            link.sent_frames(),
            vec![
                ClientFrame::Subscribe { channel: "votes".into() },
                ClientFrame::Subscribe { channel: "shard-metrics".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skips_redundant_control_frames() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;
        wait_state(&transport, ConnectionState::Connected).await;

        transport.send(ClientFrame::Unsubscribe { channel: "votes".into() }).unwrap();
        transport.send(ClientFrame::Subscribe { channel: "votes".into() }).unwrap();
        transport.send(ClientFrame::Subscribe { channel: "votes".into() }).unwrap();
        transport.send(ClientFrame::Unsubscribe { channel: "votes".into() }).unwrap();
        transport.send(ClientFrame::Unsubscribe { channel: "votes".into() }).unwrap();
        transport.flush().await.unwrap();

        assert_eq!(
            link.sent_frames(),
            vec![
                ClientFrame::Subscribe { channel: "votes".into() },
                ClientFrame::Unsubscribe { channel: "votes".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_frame_is_skipped_and_link_kept() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;
        wait_state(&transport, ConnectionState::Connected).await;

        link.fail_next_write(TransportError::Encode("bad payload".into()));
        transport.send_raw("a").unwrap();
        transport.send_raw("b").unwrap();
        transport.flush().await.unwrap();

        assert_eq!(link.sent(), vec!["b"]);
        assert_eq!(connector.dial_count(), 1);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(link.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn unsent_subscribe_is_not_marked_announced() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;
        wait_state(&transport, ConnectionState::Connected).await;

        link.fail_next_write(TransportError::Encode("bad channel".into()));
        transport.send(ClientFrame::Subscribe { channel: "votes".into() }).unwrap();
        transport.send(ClientFrame::Subscribe { channel: "votes".into() }).unwrap();
        transport.flush().await.unwrap();

        assert_eq!(
            link.sent_frames(),
            vec![ClientFrame::Subscribe { channel: "votes".into() }]
        );
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_write_failure_reconnects_and_resends() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        let first = connector.wait_for_link(0).await;
        wait_state(&transport, ConnectionState::Connected).await;

        first.fail_next_write(TransportError::Socket("broken pipe".into()));
        transport.send_raw("a").unwrap();

        let second = connector.wait_for_link(1).await;
        wait_state(&transport, ConnectionState::Connected).await;
        transport.flush().await.unwrap();
        assert!(first.sent().is_empty());
        assert_eq!(second.sent(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_inbound_frames_in_order() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        let recorder = Arc::new(Recorder::default());
        transport.on_message(&recorder);
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;

        link.push_json(&json!({"type": "tick", "channel": "a", "key": "k", "payload": 1}));
        link.push("not json");
        link.push_json(&json!({"type": "tick", "channel": "a", "key": "k", "payload": 2}));
        transport.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let payloads: Vec<_> = recorder.frames.lock().iter().map(|f| f.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_follow_backoff_schedule() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;
        wait_state(&transport, ConnectionState::Connected).await;

        connector.fail_next(2);
        let dropped_at = Instant::now();
        link.drop_connection();

        let _ = connector.wait_for_link(1).await;
        let offsets: Vec<u64> = connector
            .dial_times()
            .iter()
            .skip(1)
            .map(|t| t.duration_since(dropped_at).as_millis() as u64)
            .collect();
        assert_eq!(offsets, vec![1000, 3000, 7000]);
        wait_state(&transport, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_connect_retries() {
        let connector = MockConnector::new();
        connector.fail_next(1);
        let transport = Transport::new(connector.clone(), config(500, 8000));
        let mut states = transport.watch_state();
        transport.connect().unwrap();

        let _ = states.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();
        let _ = connector.wait_for_link(0).await;
        wait_state(&transport, ConnectionState::Connected).await;
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_dial_times_out() {
        let connector = MockConnector::new();
        connector.stall_next(1);
        let mut cfg = config(1000, 8000);
        cfg.connect_timeout = Duration::from_secs(2);
        let transport = Transport::new(connector.clone(), cfg);
        let start = Instant::now();
        transport.connect().unwrap();

        let _ = connector.wait_for_link(0).await;
        let times = connector.dial_times();
        assert_eq!(times.len(), 2);
        // 2s timeout, then the first backoff step
        assert_eq!(times[1].duration_since(start), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_forces_reconnect() {
        let connector = MockConnector::new();
        let mut cfg = config(1000, 8000);
        cfg.idle_timeout = Some(Duration::from_secs(30));
        let transport = Transport::new(connector.clone(), cfg);
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        link.heartbeat();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connector.dial_count(), 1);

        let _ = connector.wait_for_link(1).await;
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reannounces_after_drop() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        let recorder = Arc::new(Recorder::default());
        *recorder.wanted.lock() = vec!["votes".into()];
        transport.on_message(&recorder);
        transport.connect().unwrap();
        let first = connector.wait_for_link(0).await;
        transport.flush().await.unwrap();

        *recorder.wanted.lock() = vec!["votes".into(), "blocks".into()];
        first.drop_connection();
        let second = connector.wait_for_link(1).await;
        transport.flush().await.unwrap();

        assert_eq!(first.sent_frames(), vec![ClientFrame::Subscribe { channel: "votes".into() }]);
        assert_eq!(
            second.sent_frames(),
            vec![
                ClientFrame::Subscribe { channel: "votes".into() },
                ClientFrame::Subscribe { channel: "blocks".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_after_close_fails() {
        let connector = MockConnector::new();
        let transport = Transport::new(connector.clone(), config(1000, 8000));
        transport.connect().unwrap();
        let link = connector.wait_for_link(0).await;

        transport.close();
        assert!(transport.is_closed());
        assert_matches!(transport.send_raw("late"), Err(TransportError::Closed));
        assert_matches!(
            transport.send(ClientFrame::Subscribe { channel: "votes".into() }),
            Err(TransportError::Closed)
        );
        assert_matches!(transport.connect(), Err(TransportError::Closed));
        assert_matches!(transport.flush().await, Err(TransportError::Closed));

        wait_state(&transport, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.dial_count(), 1);
        assert!(!link.is_open());
    }

    #[test]
    fn state_labels() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(ConnectionState::Connected).unwrap(),
            json!("connected")
        );
    }
}
