//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use rand_core::OsRng;
use rsa::RsaPrivateKey;
use rsa::traits::PublicKeyParts;
use url::Url;

use sts_resource_secrets::error::{Error, Result};
use sts_resource_secrets::key_resolver::{FetchLimits, KeySetRetriever, RetrievalError};
use sts_resource_secrets::resource_server::ResourceServer;
use sts_resource_secrets::secret_store::{
    CredentialStore, InMemoryCredentialStore, Principal, SecretGenerator, UserCredentials,
};

/// Key-set location used for `audience`.
pub fn jwks_url(audience: &str) -> String {
    format!("https://{audience}.example.com/.well-known/jwks.json")
}

/// Resource server with the conventional test key-set location.
pub fn server(audience: &str, endpoints: &[&str]) -> ResourceServer {
    ResourceServer {
        name: None,
        audience: audience.to_string(),
        endpoints: endpoints.iter().map(|e| (*e).to_string()).collect(),
        jwks_url: Url::parse(&jwks_url(audience)).unwrap(),
    }
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
}

/// A key-set document holding one RSA encryption key.
pub fn rsa_key_set(kid: &str) -> String {
    let key = rsa_key();
    serde_json::json!({
        "keys": [{
            "kty": "RSA",
            "use": "enc",
            "kid": kid,
            "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        }]
    })
    .to_string()
}

/// A key-set document holding one P-256 encryption key.
pub fn ec_key_set(kid: &str) -> String {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    let point = p256::SecretKey::random(&mut OsRng)
        .public_key()
        .to_encoded_point(false);
    serde_json::json!({
        "keys": [{
            "kty": "EC",
            "use": "enc",
            "kid": kid,
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
            "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
        }]
    })
    .to_string()
}

/// Serves canned documents by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct StubRetriever {
    documents: HashMap<String, std::result::Result<Bytes, RetrievalError>>,
    pub calls: AtomicUsize,
}

impl StubRetriever {
    pub fn with_document(mut self, audience: &str, body: impl Into<String>) -> Self {
        self.documents
            .insert(jwks_url(audience), Ok(Bytes::from(body.into())));
        self
    }

    pub fn with_failure(mut self, audience: &str, error: RetrievalError) -> Self {
        self.documents.insert(jwks_url(audience), Err(error));
        self
    }
}

#[async_trait::async_trait]
impl KeySetRetriever for StubRetriever {
    async fn fetch(
        &self,
        url: &Url,
        _limits: &FetchLimits,
    ) -> std::result::Result<Bytes, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.documents
            .get(url.as_str())
            .cloned()
            .unwrap_or(Err(RetrievalError::Status(404)))
    }
}

/// Generator handing out `00000001`, `00000002`, ... padded to the requested
/// length.
#[derive(Default)]
pub struct SequenceGenerator(AtomicUsize);

impl SecretGenerator for SequenceGenerator {
    fn generate(&self, length: usize) -> String {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{n:0>length$}")
    }
}

/// In-memory store that counts calls and can be told to fail.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryCredentialStore,
    pub loads: AtomicUsize,
    pub stores: AtomicUsize,
    pub fail_load: bool,
}

impl CountingStore {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CredentialStore for CountingStore {
    async fn load(&self, principal: &Principal) -> Result<UserCredentials> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(Error::CredentialStore("backend unavailable".to_string()));
        }
        self.inner.load(principal).await
    }

    async fn store(&self, principal: &Principal, credentials: &UserCredentials) -> Result<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(principal, credentials).await
    }
}

pub fn shared<T: CredentialStore>(store: &Arc<T>) -> Option<Arc<dyn CredentialStore>> {
    Some(Arc::clone(store) as Arc<dyn CredentialStore>)
}
