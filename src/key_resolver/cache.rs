//! TTL cache in front of a [`KeySetRetriever`].
//!
//! Successful retrievals are kept per URL for `ttl` and shared across
//! concurrent requests. Failures are never cached, so a resource server that
//! recovers is picked up on the next request. A stale entry is refetched on
//! access, which bounds how long a rotated key can go unnoticed.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;
use url::Url;

use super::retriever::{FetchLimits, KeySetRetriever, RetrievalError};

struct CachedKeySet {
    body: Bytes,
    fetched_at: Instant,
}

/// Caching wrapper around another retriever.
pub struct CachingRetriever<R> {
    inner: R,
    entries: DashMap<String, CachedKeySet>,
    ttl: Duration,
}

impl<R: KeySetRetriever> CachingRetriever<R> {
    /// Wrap `inner`, keeping each fetched document for `ttl`.
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop every cached document.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached documents (stale ones included until refetched).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl<R: KeySetRetriever> KeySetRetriever for CachingRetriever<R> {
    async fn fetch(&self, url: &Url, limits: &FetchLimits) -> Result<Bytes, RetrievalError> {
        if let Some(cached) = self.entries.get(url.as_str()) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.body.clone());
            }
        }

        let body = self.inner.fetch(url, limits).await?;
        debug!(url = %url, bytes = body.len(), "Caching key set");
        self.entries.insert(
            url.to_string(),
            CachedKeySet {
                body: body.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(body)
    }
}
