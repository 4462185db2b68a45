//! # relay-core
//!
//! Shared vocabulary for the relay crates:
//!
//! - **Labels and ids**: [`Channel`], [`CacheKey`], [`SubscriberId`]
//! - **Wire frames**: [`ClientFrame`] (subscribe/unsubscribe), [`ServerFrame`]
//!   (channel push), and the [`Message`] union the reconciler consumes
//! - **Errors**: [`TransportError`], [`ProtocolError`], [`FetchError`]
//! - **Backoff**: [`BackoffPolicy`] for the reconnect loop
//! - **Merging**: [`MergeRule`] and the default [`DeepMerge`]

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod frames;
pub mod ids;
pub mod merge;

pub use backoff::BackoffPolicy;
pub use errors::{FetchError, ProtocolError, TransportError};
pub use frames::{ClientFrame, Message, MessageKind, ServerFrame};
pub use ids::{CacheKey, Channel, SubscriberId};
pub use merge::{DeepMerge, MergeRule, ReplaceMerge, deep_merge};
