//! Bounded key-set retrieval.
//!
//! [`KeySetRetriever`] is the seam between the key resolver and the network.
//! Every call carries [`FetchLimits`]; implementations must enforce every
//! bound and report an overrun as a [`RetrievalError`] rather than blocking.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::debug;
use url::Url;

use crate::config::KeyResolverConfig;
use crate::{Error, Result};

/// Per-call retrieval bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Maximum wait for each read on the response
    pub read_timeout: Duration,
    /// Maximum accepted body size in bytes
    pub max_bytes: usize,
    /// Deadline for the whole retrieval, headers and body included
    pub total_timeout: Duration,
}

impl From<&KeyResolverConfig> for FetchLimits {
    fn from(config: &KeyResolverConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            max_bytes: config.max_response_bytes,
            total_timeout: config.total_timeout,
        }
    }
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self::from(&KeyResolverConfig::default())
    }
}

/// Key-set retrieval failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    /// The location is not acceptable (e.g. plain HTTP when HTTPS is required).
    #[error("Invalid key-set location: {0}")]
    InvalidUrl(String),

    /// Connect or read exceeded its timeout.
    #[error("Key-set retrieval timed out: {0}")]
    Timeout(String),

    /// Network or protocol failure.
    #[error("Key-set retrieval failed: {0}")]
    Http(String),

    /// The endpoint answered with a non-success status.
    #[error("Key-set endpoint returned HTTP {0}")]
    Status(u16),

    /// The response is larger than the configured cap.
    #[error("Key-set response exceeds {limit} bytes")]
    TooLarge {
        /// Configured cap in bytes.
        limit: usize,
    },
}

/// Fetches a raw key-set document.
#[async_trait::async_trait]
pub trait KeySetRetriever: Send + Sync + 'static {
    /// Retrieve the document at `url` within `limits`.
    async fn fetch(&self, url: &Url, limits: &FetchLimits) -> std::result::Result<Bytes, RetrievalError>;
}

/// `reqwest`-backed retriever.
pub struct HttpRetriever {
    client: reqwest::Client,
    require_https: bool,
}

impl HttpRetriever {
    /// Build a client whose connect and read timeouts follow `limits`.
    ///
    /// The TCP connect timeout is fixed here. Per-call limits still bound the
    /// wait for response headers (`connect_timeout + read_timeout`), each
    /// body read and the whole retrieval (`total_timeout`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(limits: &FetchLimits, require_https: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .https_only(require_https)
            .connect_timeout(limits.connect_timeout)
            .read_timeout(limits.read_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build key-set HTTP client: {e}")))?;

        Ok(Self {
            client,
            require_https,
        })
    }
}

#[async_trait::async_trait]
impl KeySetRetriever for HttpRetriever {
    async fn fetch(&self, url: &Url, limits: &FetchLimits) -> std::result::Result<Bytes, RetrievalError> {
        if self.require_https && url.scheme() != "https" {
            return Err(RetrievalError::InvalidUrl(format!("{url} is not HTTPS")));
        }

        debug!(url = %url, "Fetching key set");

        tokio::time::timeout(limits.total_timeout, self.fetch_bounded(url, limits))
            .await
            .map_err(|_| {
                RetrievalError::Timeout(format!(
                    "{url} exceeded {}ms overall",
                    limits.total_timeout.as_millis()
                ))
            })?
    }
}

impl HttpRetriever {
    async fn fetch_bounded(
        &self,
        url: &Url,
        limits: &FetchLimits,
    ) -> std::result::Result<Bytes, RetrievalError> {
        let response = tokio::time::timeout(
            limits.connect_timeout + limits.read_timeout,
            self.client.get(url.clone()).send(),
        )
        .await
        .map_err(|_| RetrievalError::Timeout(url.to_string()))?
        .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Status(status.as_u16()));
        }

        let limit = limits.max_bytes;
        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(RetrievalError::TooLarge { limit });
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(limits.read_timeout, stream.next())
                .await
                .map_err(|_| RetrievalError::Timeout(url.to_string()))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(classify)?;

            if body.len() + chunk.len() > limit {
                return Err(RetrievalError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

fn classify(err: reqwest::Error) -> RetrievalError {
    if err.is_timeout() {
        RetrievalError::Timeout(err.to_string())
    } else {
        RetrievalError::Http(err.to_string())
    }
}
