use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_core::{Channel, ClientFrame, ServerFrame, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::connector::{Connector, FrameSink, FrameStream, Inbound};
use super::{ConnectionState, Outbound, Shared, TransportCmd, TransportConfig};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

enum Flow {
    Continue,
    Stop,
}

enum Dial {
    Connected(FrameSink, FrameStream),
    Failed(TransportError),
    Stop,
}

enum SessionEnd {
    Dropped(TransportError),
    Closed,
}

pub(super) struct TransportActor {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
    /// Raw frames waiting for a link.
    pending: VecDeque<String>,
    /// Channels subscribed on the current physical link.
    announced: HashSet<Channel>,
}

impl TransportActor {
    pub(super) fn new(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        shared: Arc<Shared>,
        cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
    ) -> Self {
        Self {
            connector,
            config,
            shared,
            cmd_rx,
            pending: VecDeque::new(),
            announced: HashSet::new(),
        }
    }

    pub(super) async fn run(mut self) {
        if self.wait_for_connect().await {
            self.connect_loop().await;
        }
        self.pending.clear();
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("transport task finished");
    }

    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.cmd_rx.recv().await {
                Some(TransportCmd::Connect) => return true,
                cmd => {
                    if let Flow::Stop = self.handle_offline(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    async fn connect_loop(&mut self) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            self.shared.set_state(if ever_connected || attempt > 0 {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.dial().await {
                Dial::Stop => return,
                Dial::Failed(err) => {
                    warn!(attempt, error = %err, kind = err.error_kind(), "connect attempt failed");
                    self.shared.set_state(ConnectionState::Reconnecting);
                }
                Dial::Connected(sink, stream) => {
                    attempt = 0;
                    ever_connected = true;
                    match self.run_session(sink, stream).await {
                        SessionEnd::Closed => return,
                        SessionEnd::Dropped(err) => {
                            warn!(error = %err, kind = err.error_kind(), "connection lost");
                            self.shared.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
            }

            let delay = self.config.backoff.delay(attempt);
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            if let Flow::Stop = self.sleep_offline(delay).await {
                return;
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Dial once, bounded by the connect timeout, while still serving commands.
    async fn dial(&mut self) -> Dial {
        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout;
        let attempt = async move {
            match tokio::time::timeout(timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(timeout.as_millis() as u64)),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    if let Flow::Stop = self.handle_offline(cmd) {
                        return Dial::Stop;
                    }
                }
                result = &mut attempt => {
                    return match result {
                        Ok((sink, stream)) => Dial::Connected(sink, stream),
                        Err(err) => Dial::Failed(err),
                    };
                }
            }
        }
    }

    async fn sleep_offline(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    if let Flow::Stop = self.handle_offline(cmd) {
                        return Flow::Stop;
                    }
                }
                () = &mut sleep => return Flow::Continue,
            }
        }
    }

    fn handle_offline(&mut self, cmd: Option<TransportCmd>) -> Flow {
        match cmd {
            Some(TransportCmd::Connect) => Flow::Continue,
            Some(TransportCmd::Send(Outbound::Control(frame))) => {
                // rebuilt from wanted_channels on the next connect
                trace!(channel = %frame.channel(), "dropping offline control frame");
                Flow::Continue
            }
            Some(TransportCmd::Send(Outbound::Raw(text))) => {
                self.pending.push_back(text);
                Flow::Continue
            }
            Some(TransportCmd::Flush(done)) => {
                let _ = done.send(());
                Flow::Continue
            }
            Some(TransportCmd::Close) | None => Flow::Stop,
        }
    }

    async fn run_session(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
        self.announced.clear();
        if let Err(err) = self.announce_wanted(&mut sink).await {
            return SessionEnd::Dropped(err);
        }
        if let Err(err) = self.flush_pending(&mut sink).await {
            return SessionEnd::Dropped(err);
        }
        self.shared.set_state(ConnectionState::Connected);
        info!(channels = self.announced.len(), "connected");

        let idle = self.config.idle_timeout;
        let idle_sleep = tokio::time::sleep(idle.unwrap_or(FAR_FUTURE));
        tokio::pin!(idle_sleep);

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(TransportCmd::Send(out)) => {
                        if let Err(err) = self.write(&mut sink, out).await {
                            if err.is_retryable() {
                                return SessionEnd::Dropped(err);
                            }
                            warn!(error = %err, kind = err.error_kind(), "skipping unsendable frame");
                        }
                    }
                    Some(TransportCmd::Connect) => {}
                    Some(TransportCmd::Flush(done)) => {
                        let _ = done.send(());
                    }
                    Some(TransportCmd::Close) | None => {
                        if let Err(err) = sink.close().await {
                            debug!(error = %err, "error closing link");
                        }
                        info!("transport closed");
                        return SessionEnd::Closed;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Inbound::Text(text))) => {
                        if let Some(idle) = idle {
                            idle_sleep.as_mut().reset(Instant::now() + idle);
                        }
                        self.deliver(&text);
                    }
                    Some(Ok(Inbound::Heartbeat)) => {
                        if let Some(idle) = idle {
                            idle_sleep.as_mut().reset(Instant::now() + idle);
                        }
                    }
                    Some(Err(err)) => return SessionEnd::Dropped(err),
                    None => {
                        return SessionEnd::Dropped(TransportError::Socket("stream ended".into()));
                    }
                },
                () = &mut idle_sleep, if idle.is_some() => {
                    let ms = idle.map_or(0, |d| d.as_millis() as u64);
                    return SessionEnd::Dropped(TransportError::Socket(format!(
                        "no inbound traffic for {ms}ms"
                    )));
                }
            }
        }
    }

    async fn announce_wanted(&mut self, sink: &mut FrameSink) -> Result<(), TransportError> {
        let wanted = self
            .shared
            .handler()
            .map(|h| h.wanted_channels())
            .unwrap_or_default();
        for channel in wanted {
            if self.announced.contains(&channel) {
                continue;
            }
            let frame = ClientFrame::Subscribe {
                channel: channel.clone(),
            };
            match Self::write_control(sink, &frame).await {
                Ok(()) => {
                    let _ = self.announced.insert(channel);
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(channel = %channel, error = %err, "skipping unsendable subscribe");
                }
            }
        }
        Ok(())
    }

    async fn flush_pending(&mut self, sink: &mut FrameSink) -> Result<(), TransportError> {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "flushing queued frames");
        }
        while let Some(text) = self.pending.pop_front() {
            if let Err(err) = sink.send(text.clone()).await {
                if !err.is_retryable() {
                    warn!(error = %err, "dropping unsendable queued frame");
                    continue;
                }
                self.pending.push_front(text);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn write(&mut self, sink: &mut FrameSink, out: Outbound) -> Result<(), TransportError> {
        match out {
            Outbound::Control(frame) => {
                let needed = match &frame {
                    ClientFrame::Subscribe { channel } => self.announced.insert(channel.clone()),
                    ClientFrame::Unsubscribe { channel } => self.announced.remove(channel),
                };
                if !needed {
                    trace!(channel = %frame.channel(), "server already agrees, skipping frame");
                    return Ok(());
                }
                let result = Self::write_control(sink, &frame).await;
                if result.is_err() {
                    // The server never saw it.
                    let _ = match &frame {
                        ClientFrame::Subscribe { channel } => self.announced.remove(channel),
                        ClientFrame::Unsubscribe { channel } => self.announced.insert(channel.clone()),
                    };
                }
                result
            }
            Outbound::Raw(text) => {
                if let Err(err) = sink.send(text.clone()).await {
                    if err.is_retryable() {
                        self.pending.push_front(text);
                    }
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    async fn write_control(sink: &mut FrameSink, frame: &ClientFrame) -> Result<(), TransportError> {
        let text = frame
            .to_json()
            .map_err(|e| TransportError::Encode(format!("{} frame: {e}", frame.channel())))?;
        debug!(frame = %text, "send");
        sink.send(text).await
    }

    fn deliver(&self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };
        match self.shared.handler() {
            Some(handler) => handler.on_frame(frame),
            None => debug!(event = %frame.event, "no frame handler registered, dropping"),
        }
    }
}
