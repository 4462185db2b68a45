//! Reference-counted channel interest and inbound routing.
//!
//! A channel is announced to the server while at least one subscriber holds a
//! [`ChannelLease`] for it. Counts are tracked per subscriber identity, so a
//! repeated subscribe by the same subscriber does not inflate them. Frames are
//! handed to the transport while the table lock is held, which keeps the
//! transport's view of 0→1 and 1→0 transitions in table order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use relay_core::{Channel, ClientFrame, Message, ProtocolError, ServerFrame, SubscriberId, TransportError};
use tracing::{debug, warn};

use crate::classifier::MessageClassifier;
use crate::reconciler::Reconciler;
use crate::transport::{FrameHandler, Transport};

/// Demultiplexes inbound frames and owns channel reference counts.
pub struct Multiplexer {
    transport: Transport,
    reconciler: Reconciler,
    classifier: Arc<dyn MessageClassifier>,
    subscribers: Mutex<HashMap<Channel, HashSet<SubscriberId>>>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channels", &self.subscribers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create a multiplexer and register it as the transport's frame handler.
    pub fn new(
        transport: Transport,
        reconciler: Reconciler,
        classifier: Arc<dyn MessageClassifier>,
    ) -> Arc<Self> {
        let mux = Arc::new(Self {
            transport,
            reconciler,
            classifier,
            subscribers: Mutex::new(HashMap::new()),
        });
        mux.transport.on_message(&mux);
        mux
    }

    /// Register `subscriber`'s interest in `channel`.
    ///
    /// The first subscriber triggers a subscribe frame (and a connect).
    /// Subscribing an already registered subscriber is a no-op apart from
    /// returning another lease for the same registration.
    pub fn subscribe(
        self: &Arc<Self>,
        channel: Channel,
        subscriber: SubscriberId,
    ) -> Result<ChannelLease, TransportError> {
        {
            let mut table = self.subscribers.lock();
            let set = table.entry(channel.clone()).or_default();
            if set.insert(subscriber.clone()) && set.len() == 1 {
                let sent = self.transport.connect().and_then(|()| {
                    self.transport.send(ClientFrame::Subscribe {
                        channel: channel.clone(),
                    })
                });
                if let Err(err) = sent {
                    let _ = table.remove(&channel);
                    return Err(err);
                }
                debug!(channel = %channel, "channel wanted");
            }
        }

        Ok(ChannelLease {
            mux: Arc::downgrade(self),
            channel,
            subscriber,
            released: false,
        })
    }

    /// Number of distinct subscribers for `channel`.
    pub fn ref_count(&self, channel: &Channel) -> usize {
        self.subscribers.lock().get(channel).map_or(0, HashSet::len)
    }

    /// Channels with at least one subscriber, sorted.
    pub fn wanted_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.subscribers.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Classify `frame` and hand it to the reconciler.
    pub fn route(&self, frame: ServerFrame) -> Result<(), ProtocolError> {
        let Some(channel) = frame.channel.as_ref() else {
            return Err(ProtocolError::MissingChannel(frame.event));
        };
        if self.ref_count(channel) == 0 {
            return Err(ProtocolError::UnknownChannel(channel.clone()));
        }
        let kind = self.classifier.classify(&frame);
        let message = Message::from_frame(frame, kind)?;
        self.reconciler.apply(message);
        Ok(())
    }

    fn release(&self, channel: &Channel, subscriber: &SubscriberId) {
        let mut table = self.subscribers.lock();
        let Some(set) = table.get_mut(channel) else {
            return;
        };
        if !set.remove(subscriber) || !set.is_empty() {
            return;
        }
        let _ = table.remove(channel);
        debug!(channel = %channel, "channel no longer wanted");
        if let Err(err) = self.transport.send(ClientFrame::Unsubscribe {
            channel: channel.clone(),
        }) {
            debug!(channel = %channel, error = %err, "unsubscribe not sent");
        }
    }
}

impl FrameHandler for Multiplexer {
    fn on_frame(&self, frame: ServerFrame) {
        match self.route(frame) {
            Ok(()) => {}
            Err(ProtocolError::MissingChannel(event)) => {
                debug!(event = %event, "ignoring frame without channel");
            }
            Err(ProtocolError::UnknownChannel(channel)) => {
                warn!(channel = %channel, "dropping frame for channel with no subscribers");
            }
            Err(err) => warn!(error = %err, "dropping unroutable frame"),
        }
    }

    fn wanted_channels(&self) -> Vec<Channel> {
        Multiplexer::wanted_channels(self)
    }
}

/// Interest in one channel held by one subscriber.
///
/// Released explicitly with [`release`](Self::release) or on drop.
pub struct ChannelLease {
    mux: Weak<Multiplexer>,
    channel: Channel,
    subscriber: SubscriberId,
    released: bool,
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("channel", &self.channel)
            .field("subscriber", &self.subscriber)
            .field("released", &self.released)
            .finish()
    }
}

impl ChannelLease {
    /// Channel this lease holds.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Subscriber this lease belongs to.
    pub fn subscriber(&self) -> &SubscriberId {
        &self.subscriber
    }

    /// Drop the interest now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(mux) = self.mux.upgrade() {
            mux.release(&self.channel, &self.subscriber);
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
