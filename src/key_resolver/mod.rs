//! Encryption key discovery for resource servers.
//!
//! # Resolution flow
//!
//! 1. Retrieve the resource server's key set through a [`KeySetRetriever`]
//!    (bounded by [`FetchLimits`], optionally cached by [`CachingRetriever`]).
//! 2. Parse the document. Individual keys that do not parse are skipped; a
//!    document that is not a key set at all is a resolution failure.
//! 3. Keep keys whose declared `use` is `enc` and return the first one in
//!    document order.
//!
//! "No encryption key" is `Ok(None)`, distinct from a retrieval failure.

pub mod cache;
pub mod retriever;

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::algorithm::KeyType;
use crate::config::KeyResolverConfig;
use crate::resource_server::ResourceServer;

pub use cache::CachingRetriever;
pub use retriever::{FetchLimits, HttpRetriever, KeySetRetriever, RetrievalError};

/// Key `use` value marking encryption keys.
pub const ENCRYPTION_USE: &str = "enc";

/// A public key taken from a resource server's key set.
///
/// Only the members needed for RSA and EC encryption are modelled; other
/// members are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredKey {
    /// Key type (`RSA`, `EC`, ...)
    pub kty: String,
    /// Declared use (`enc` / `sig`)
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// Key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Declared algorithm, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA public exponent (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// EC curve name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl DiscoveredKey {
    /// Classified key type.
    #[must_use]
    pub fn key_type(&self) -> KeyType {
        KeyType::from_kty(&self.kty)
    }

    /// Whether the key declares encryption use.
    #[must_use]
    pub fn is_encryption_key(&self) -> bool {
        self.key_use.as_deref() == Some(ENCRYPTION_USE)
    }

    /// Decode a base64url member, naming it in the error.
    pub(crate) fn decode_member(
        value: Option<&str>,
        member: &str,
    ) -> std::result::Result<Vec<u8>, String> {
        let value = value.ok_or_else(|| format!("missing '{member}' member"))?;
        URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .map_err(|e| format!("invalid base64url in '{member}': {e}"))
    }
}

/// Why a key could not be resolved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyResolutionError {
    /// Retrieval failed (network, timeout, status, oversize).
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// The document is not a JSON key set.
    #[error("Malformed key set: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct KeySetDocument {
    keys: Vec<serde_json::Value>,
}

/// Parse a key-set document, skipping keys that do not deserialize.
pub fn parse_key_set(body: &[u8]) -> std::result::Result<Vec<DiscoveredKey>, KeyResolutionError> {
    let document: KeySetDocument =
        serde_json::from_slice(body).map_err(|e| KeyResolutionError::Malformed(e.to_string()))?;

    Ok(document
        .keys
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<DiscoveredKey>(value) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(error = %e, "Skipping unparseable key in key set");
                None
            }
        })
        .collect())
}

/// First encryption key in document order.
#[must_use]
pub fn select_encryption_key(keys: Vec<DiscoveredKey>) -> Option<DiscoveredKey> {
    keys.into_iter().find(DiscoveredKey::is_encryption_key)
}

/// Resolves a resource server's current encryption key.
pub struct KeyResolver {
    retriever: Arc<dyn KeySetRetriever>,
    limits: FetchLimits,
}

impl KeyResolver {
    /// Create a resolver over an explicit retriever.
    #[must_use]
    pub fn new(retriever: Arc<dyn KeySetRetriever>, limits: FetchLimits) -> Self {
        Self { retriever, limits }
    }

    /// Build the HTTP retriever described by `config`, cached when
    /// `cache_ttl` is non-zero.
    pub fn from_config(config: &KeyResolverConfig) -> Result<Self> {
        let limits = FetchLimits::from(config);
        let http = HttpRetriever::new(&limits, config.require_https)?;

        let retriever: Arc<dyn KeySetRetriever> = if config.cache_ttl.is_zero() {
            Arc::new(http)
        } else {
            Arc::new(CachingRetriever::new(http, config.cache_ttl))
        };

        Ok(Self::new(retriever, limits))
    }

    /// Fetch the server's key set and pick its encryption key.
    ///
    /// Returns `Ok(None)` when the key set has no key declared for
    /// encryption.
    pub async fn resolve_encryption_key(
        &self,
        server: &ResourceServer,
    ) -> std::result::Result<Option<DiscoveredKey>, KeyResolutionError> {
        let body = self.retriever.fetch(&server.jwks_url, &self.limits).await?;
        let keys = parse_key_set(&body)?;
        let total = keys.len();
        let key = select_encryption_key(keys);

        debug!(
            audience = %server.audience,
            keys = total,
            kid = ?key.as_ref().and_then(|k| k.kid.as_deref()),
            "Resolved key set"
        );
        Ok(key)
    }
}
