use relay_core::{CacheKey, FetchError, TransportError};
use thiserror::Error;

/// Errors returned by [`LiveClient`](crate::LiveClient) and
/// [`LiveQuery`](crate::LiveQuery).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The client was closed.
    #[error("client closed")]
    Closed,
    /// The transport rejected a frame.
    #[error(transparent)]
    Transport(TransportError),
    /// A refetch failed. The cached value, if any, was kept.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// No fetcher is configured, so the key can only be filled by pushes.
    #[error("no fetcher configured for {0}")]
    NoFetcher(CacheKey),
    /// The entry was evicted while waiting on it.
    #[error("cache entry {0} was evicted")]
    Evicted(CacheKey),
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_maps_to_closed() {
        assert_eq!(RelayError::from(TransportError::Closed), RelayError::Closed);
        assert_eq!(
            RelayError::from(TransportError::Encode("x".into())),
            RelayError::Transport(TransportError::Encode("x".into()))
        );
    }

    #[test]
    fn fetch_error_is_transparent() {
        let err = RelayError::from(FetchError::from_status(502, "bad gateway"));
        assert_eq!(err.to_string(), "server returned 502: bad gateway");
    }
}
