//! HTTP refetch.
//!
//! A refetch result is always a full snapshot of the key.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{CacheKey, FetchError};
use serde_json::Value;
use tracing::{debug, instrument};

/// Loads the current value of a cache key out of band.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full value for `key`.
    async fn fetch(&self, key: &CacheKey) -> Result<Value, FetchError>;
}

/// `GET {base_url}/{key}` returning JSON.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    /// Build a fetcher with its own connection pool.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Build a fetcher on a shared client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// URL requested for `key`.
    pub fn url_for(&self, key: &CacheKey) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            key.as_str().trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), fields(key = %key))]
    async fn fetch(&self, key: &CacheKey) -> Result<Value, FetchError> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "refetch rejected");
            return Err(FetchError::from_status(status.as_u16(), body));
        }

        let bytes = response.bytes().await.map_err(classify_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn classify_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let f = HttpFetcher::with_client(reqwest::Client::new(), "http://host:5000/");
        assert_eq!(f.url_for(&"/api/shards".into()), "http://host:5000/api/shards");
        assert_eq!(f.url_for(&"votes".into()), "http://host:5000/votes");
    }

    #[test]
    fn url_keeps_base_path() {
        let f = HttpFetcher::with_client(reqwest::Client::new(), "https://tburn.io/api");
        assert_eq!(f.url_for(&"network/stats".into()), "https://tburn.io/api/network/stats");
    }
}
