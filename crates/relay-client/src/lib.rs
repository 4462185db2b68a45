//! # relay-client
//!
//! Real-time subscription and cache-sync layer for the TBURN dashboard.
//!
//! - [`Transport`]: one persistent connection, reconnect with backoff,
//!   ordered delivery, re-announce of wanted channels after every reconnect
//! - [`Multiplexer`]: per-channel subscriber counts and inbound routing
//! - [`CacheStore`]: values with freshness metadata and a single-flight
//!   refetch gate
//! - [`Reconciler`]: snapshot and delta application
//! - [`LiveClient`] / [`LiveQuery`]: what views consume
//!
//! ```no_run
//! # async fn demo() -> Result<(), relay_client::RelayError> {
//! let client = relay_client::LiveClient::new(relay_settings::RelaySettings::default())?;
//! let mut shards = client.subscribe("shard-metrics", "shards")?;
//! let view = shards.changed().await?;
//! println!("{:?} stale={}", view.value, shards.is_stale());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod cache;
pub mod classifier;
pub mod client;
pub mod error;
pub mod fetcher;
pub mod mock;
pub mod multiplexer;
pub mod reconciler;
pub mod transport;

pub use cache::{CacheEntry, CacheStore, CacheView, Invalidation};
pub use classifier::{EventNameClassifier, MessageClassifier};
pub use client::{LiveClient, LiveClientBuilder, LiveQuery, QueryOptions};
pub use error::RelayError;
pub use fetcher::{Fetcher, HttpFetcher};
pub use multiplexer::{ChannelLease, Multiplexer};
pub use reconciler::Reconciler;
pub use transport::{
    ConnectionState, Connector, FrameHandler, Inbound, Transport, TransportConfig, WsConnector,
};
