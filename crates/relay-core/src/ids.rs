//! Routing labels and subscriber identity.
//!
//! [`Channel`] and [`CacheKey`] are labels agreed with the server, so they are
//! built from existing strings. [`SubscriberId`] is minted locally and carries
//! a `sub_` prefix followed by a time-ordered UUID.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_label {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_label!(
    /// Named logical stream of push updates from server to client.
    Channel
);

string_label!(
    /// Identifies one cache entry. Path-like keys double as HTTP refetch paths.
    CacheKey
);

/// Identity of one consumer holding interest in a channel.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(format!("sub_{}", Uuid::now_v7()))
    }

    /// Use a caller-chosen identity (e.g. a view component's stable id).
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn subscriber_id_has_prefix() {
        let id = SubscriberId::new();
        assert!(id.as_str().starts_with("sub_"), "got: {id}");
    }

    #[test]
    fn subscriber_ids_are_unique() {
        assert_ne!(SubscriberId::new(), SubscriberId::new());
    }

    #[test]
    fn subscriber_ids_are_time_ordered() {
        let ids: Vec<SubscriberId> = (0..50).map(|_| SubscriberId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = SubscriberId::from_raw("shard-monitor");
        assert_eq!(id.as_str(), "shard-monitor");
    }

    #[test]
    fn channel_display_and_parse() {
        let ch = Channel::new("shard-metrics");
        assert_eq!(ch.to_string(), "shard-metrics");
        let parsed: Channel = "shard-metrics".parse().unwrap();
        assert_eq!(ch, parsed);
    }

    #[test]
    fn labels_serialize_transparently() {
        let key = CacheKey::from("/api/shards");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"/api/shards\"");
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(Channel::from("votes"), 3);
        assert_eq!(map.get("votes"), Some(&3));
    }
}
