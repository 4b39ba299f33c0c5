//! Secret issuance pipeline.
//!
//! For one request, [`SecretIssuer::issue`]:
//!
//! 1. returns nothing when no audience or resource hint was given,
//! 2. resolves hints to resource servers, one candidate per server,
//! 3. obtains or creates the principal's secret for every candidate,
//! 4. resolves each server's encryption key, picks the algorithms and seals
//!    the secret into an envelope.
//!
//! Step 4 runs concurrently across candidates (bounded by
//! `max_concurrency`) and is isolated per candidate: a failure leaves that
//! entry without an envelope and is recorded as its [`EncryptionOutcome`].
//! Only credential store failures and cancellation fail the request.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::algorithm::select_header;
use crate::audit::{self, AuditEvent};
use crate::config::Config;
use crate::envelope::{self, EncryptedEnvelope};
use crate::key_resolver::KeyResolver;
use crate::resource_server::{ResourceServer, ResourceServerRegistry, dedup_servers};
use crate::secret_store::{
    CredentialStore, FileCredentialStore, Principal, SecretStoreAdapter,
};
use crate::{Error, Result};

/// Default bound on concurrent per-candidate key resolution.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// What happened when sealing a candidate's secret.
#[derive(Debug, Clone)]
pub enum EncryptionOutcome {
    /// An envelope was produced.
    Encrypted(EncryptedEnvelope),
    /// No secret was available (no credential store configured).
    NoSecret,
    /// The key set could not be retrieved or parsed.
    RetrievalFailed(String),
    /// The key set has no key declared for encryption.
    NoEncryptionKey,
    /// The encryption key's type has no algorithm mapping.
    UnsupportedKeyType(String),
    /// Building the envelope failed.
    EncryptionFailed(String),
}

impl EncryptionOutcome {
    /// Whether an envelope was produced.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

impl fmt::Display for EncryptionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypted(envelope) => write!(f, "encrypted ({})", envelope.algorithms()),
            Self::NoSecret => f.write_str("no secret available"),
            Self::RetrievalFailed(reason) => write!(f, "key set retrieval failed: {reason}"),
            Self::NoEncryptionKey => f.write_str("no encryption key in key set"),
            Self::UnsupportedKeyType(kty) => write!(f, "unsupported key type '{kty}'"),
            Self::EncryptionFailed(reason) => write!(f, "encryption failed: {reason}"),
        }
    }
}

/// One resource server's slot in an issuance request.
#[derive(Clone)]
pub struct CandidateEntry {
    server: Arc<ResourceServer>,
    raw_secret: Option<String>,
    outcome: Option<EncryptionOutcome>,
}

impl CandidateEntry {
    /// Fresh candidate with no secret and no envelope.
    #[must_use]
    pub fn new(server: Arc<ResourceServer>) -> Self {
        Self {
            server,
            raw_secret: None,
            outcome: None,
        }
    }

    /// The resource server.
    #[must_use]
    pub fn resource_server(&self) -> &Arc<ResourceServer> {
        &self.server
    }

    /// The resource server's audience.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.server.audience
    }

    /// Plaintext secret, once resolved.
    #[must_use]
    pub fn raw_secret(&self) -> Option<&str> {
        self.raw_secret.as_deref()
    }

    /// The envelope, if sealing succeeded.
    #[must_use]
    pub fn envelope(&self) -> Option<&EncryptedEnvelope> {
        match &self.outcome {
            Some(EncryptionOutcome::Encrypted(envelope)) => Some(envelope),
            _ => None,
        }
    }

    /// Whether an envelope is attached. Check this before using the entry.
    #[must_use]
    pub fn has_envelope(&self) -> bool {
        self.envelope().is_some()
    }

    /// How sealing went, once attempted.
    #[must_use]
    pub fn outcome(&self) -> Option<&EncryptionOutcome> {
        self.outcome.as_ref()
    }

    /// Copy of this entry carrying `secret`.
    #[must_use]
    pub fn with_raw_secret(self, secret: String) -> Self {
        Self {
            raw_secret: Some(secret),
            ..self
        }
    }

    /// Copy of this entry carrying `outcome`.
    #[must_use]
    pub fn with_outcome(self, outcome: EncryptionOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..self
        }
    }

    /// The externally visible pair for this entry.
    #[must_use]
    pub fn to_issued(&self) -> IssuedSecret {
        IssuedSecret {
            audience: self.server.audience.clone(),
            encrypted_secret: self.envelope().map(|e| e.as_str().to_string()),
        }
    }
}

impl fmt::Debug for CandidateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateEntry")
            .field("audience", &self.server.audience)
            .field("raw_secret", &self.raw_secret.as_ref().map(|_| "[REDACTED]"))
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Audience paired with its serialized envelope, for token assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedSecret {
    /// Resource server audience.
    pub audience: String,
    /// Compact JWE, absent when sealing failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_secret: Option<String>,
}

/// Claims map of `audience -> envelope` holding only sealed entries.
#[must_use]
pub fn secret_claims(entries: &[CandidateEntry]) -> serde_json::Map<String, serde_json::Value> {
    entries
        .iter()
        .filter_map(|entry| {
            entry.envelope().map(|envelope| {
                (
                    entry.audience().to_string(),
                    serde_json::Value::String(envelope.as_str().to_string()),
                )
            })
        })
        .collect()
}

/// Issues per-resource-server secrets sealed to each server's key.
pub struct SecretIssuer {
    registry: Arc<ResourceServerRegistry>,
    secrets: SecretStoreAdapter,
    keys: KeyResolver,
    max_concurrency: usize,
}

impl SecretIssuer {
    /// Assemble an issuer from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ResourceServerRegistry>,
        secrets: SecretStoreAdapter,
        keys: KeyResolver,
    ) -> Self {
        Self {
            registry,
            secrets,
            keys,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Bound concurrent key resolution per request (minimum 1).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Build the registry, credential store and key resolver from `config`.
    ///
    /// Without `credential_store.directory`, candidates are listed but no
    /// secrets are issued.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = ResourceServerRegistry::from_config(&config.resource_servers)?;

        let store: Option<Arc<dyn CredentialStore>> =
            match config.credential_store.resolved_directory() {
                Some(dir) => Some(Arc::new(FileCredentialStore::new(dir)?)),
                None => None,
            };
        let secrets = SecretStoreAdapter::from_config(store, &config.secrets);
        let keys = KeyResolver::from_config(&config.key_resolver)?;

        Ok(Self::new(Arc::new(registry), secrets, keys)
            .with_max_concurrency(config.issuance.max_concurrency))
    }

    /// The resource server registry.
    #[must_use]
    pub fn registry(&self) -> &ResourceServerRegistry {
        &self.registry
    }

    /// The key resolver.
    #[must_use]
    pub fn key_resolver(&self) -> &KeyResolver {
        &self.keys
    }

    /// The secret store adapter.
    #[must_use]
    pub fn secrets(&self) -> &SecretStoreAdapter {
        &self.secrets
    }

    /// Resolve hints to candidates, one per resource server.
    ///
    /// Audience matches come first, then endpoint matches, each in hint
    /// order. Unknown hints are skipped.
    #[must_use]
    pub fn resolve_candidates<S: AsRef<str>>(
        &self,
        audiences: &[S],
        endpoints: &[S],
    ) -> Vec<CandidateEntry> {
        let by_audience = self.registry.resolve_by_audiences(audiences);
        let by_endpoint = self.registry.resolve_by_endpoints(endpoints);

        dedup_servers(by_audience.into_iter().chain(by_endpoint))
            .into_iter()
            .map(CandidateEntry::new)
            .collect()
    }

    /// Issue secrets for `principal` to the servers named by the hints.
    ///
    /// Every selected server appears in the result, with or without an
    /// envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialStore`] if loading or storing the
    /// principal's credentials fails.
    pub async fn issue(
        &self,
        audiences: Option<&[String]>,
        endpoints: Option<&[String]>,
        principal: &Principal,
    ) -> Result<Vec<CandidateEntry>> {
        let audiences = audiences.unwrap_or_default();
        let endpoints = endpoints.unwrap_or_default();

        if audiences.is_empty() && endpoints.is_empty() {
            debug!(principal = %principal, "No audience or resource hints, nothing to issue");
            return Ok(Vec::new());
        }

        let candidates = self.resolve_candidates(audiences, endpoints);
        if candidates.is_empty() {
            debug!(principal = %principal, "Hints matched no resource server");
            return Ok(Vec::new());
        }

        let candidates = self.secrets.resolve_secrets(principal, candidates).await?;

        let entries: Vec<CandidateEntry> = stream::iter(candidates)
            .map(|candidate| self.seal_candidate(principal, candidate))
            .buffered(self.max_concurrency)
            .collect()
            .await;

        info!(
            principal = %principal,
            candidates = entries.len(),
            encrypted = entries.iter().filter(|e| e.has_envelope()).count(),
            "Issued resource server secrets"
        );
        Ok(entries)
    }

    /// [`issue`](Self::issue), abandoned as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] on cancellation; partial results are
    /// discarded.
    pub async fn issue_with_cancellation(
        &self,
        audiences: Option<&[String]>,
        endpoints: Option<&[String]>,
        principal: &Principal,
        cancel: &CancellationToken,
    ) -> Result<Vec<CandidateEntry>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(principal = %principal, "Issuance cancelled");
                Err(Error::Cancelled)
            }
            result = self.issue(audiences, endpoints, principal) => result,
        }
    }

    async fn seal_candidate(&self, principal: &Principal, candidate: CandidateEntry) -> CandidateEntry {
        let outcome = self.encrypt(&candidate).await;

        match &outcome {
            EncryptionOutcome::Encrypted(envelope) => {
                debug!(
                    audience = %candidate.audience(),
                    kid = ?envelope.kid(),
                    algorithms = %envelope.algorithms(),
                    "Sealed secret"
                );
                audit::emit(&AuditEvent::encrypted(principal, candidate.audience(), envelope));
            }
            EncryptionOutcome::NoSecret => {}
            failure => {
                warn!(
                    audience = %candidate.audience(),
                    url = %candidate.resource_server().jwks_url,
                    reason = %failure,
                    "Skipping resource server"
                );
                audit::emit(&AuditEvent::skipped(
                    principal,
                    candidate.audience(),
                    failure.to_string(),
                ));
            }
        }

        candidate.with_outcome(outcome)
    }

    async fn encrypt(&self, candidate: &CandidateEntry) -> EncryptionOutcome {
        let Some(secret) = candidate.raw_secret() else {
            return EncryptionOutcome::NoSecret;
        };

        let key = match self.keys.resolve_encryption_key(candidate.resource_server()).await {
            Ok(Some(key)) => key,
            Ok(None) => return EncryptionOutcome::NoEncryptionKey,
            Err(e) => return EncryptionOutcome::RetrievalFailed(e.to_string()),
        };

        let Some(algorithms) = select_header(&key) else {
            return EncryptionOutcome::UnsupportedKeyType(key.kty);
        };

        match envelope::seal(secret.as_bytes(), &key, algorithms) {
            Ok(envelope) => EncryptionOutcome::Encrypted(envelope),
            Err(e) => EncryptionOutcome::EncryptionFailed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use url::Url;

    use super::*;
    use crate::envelope::test_support::{self, TestRecipient};
    use crate::key_resolver::{FetchLimits, KeySetRetriever, RetrievalError};
    use crate::secret_store::InMemoryCredentialStore;

    /// Serves fixed documents keyed by URL; unknown URLs are 404.
    struct StaticRetriever(HashMap<String, std::result::Result<Bytes, RetrievalError>>);

    #[async_trait::async_trait]
    impl KeySetRetriever for StaticRetriever {
        async fn fetch(
            &self,
            url: &Url,
            _limits: &FetchLimits,
        ) -> std::result::Result<Bytes, RetrievalError> {
            self.0
                .get(url.as_str())
                .cloned()
                .unwrap_or(Err(RetrievalError::Status(404)))
        }
    }

    /// Never completes; stands in for a hung key-set endpoint.
    struct PendingRetriever;

    #[async_trait::async_trait]
    impl KeySetRetriever for PendingRetriever {
        async fn fetch(
            &self,
            _url: &Url,
            _limits: &FetchLimits,
        ) -> std::result::Result<Bytes, RetrievalError> {
            futures::future::pending().await
        }
    }

    fn jwks_url(audience: &str) -> String {
        format!("https://{audience}.example.com/jwks.json")
    }

    fn server(audience: &str, endpoints: &[&str]) -> ResourceServer {
        ResourceServer {
            name: None,
            audience: audience.to_string(),
            endpoints: endpoints.iter().map(|e| (*e).to_string()).collect(),
            jwks_url: Url::parse(&jwks_url(audience)).unwrap(),
        }
    }

    fn key_set(recipient: &TestRecipient) -> Bytes {
        let jwk = serde_json::to_value(recipient.public_jwk()).unwrap();
        Bytes::from(serde_json::json!({ "keys": [jwk] }).to_string())
    }

    fn issuer(
        documents: Vec<(&str, std::result::Result<Bytes, RetrievalError>)>,
        store: Option<Arc<dyn CredentialStore>>,
    ) -> SecretIssuer {
        let registry = ResourceServerRegistry::new([
            server("aud1", &["res1"]),
            server("aud2", &["res2"]),
            server("aud3", &[]),
        ])
        .unwrap();
        let documents = documents
            .into_iter()
            .map(|(aud, doc)| (jwks_url(aud), doc))
            .collect();
        let keys = KeyResolver::new(
            Arc::new(StaticRetriever(documents)),
            FetchLimits::default(),
        );
        SecretIssuer::new(Arc::new(registry), SecretStoreAdapter::new(store), keys)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[tokio::test]
    async fn envelopes_decrypt_to_stable_secret_across_requests() {
        // GIVEN: aud1 publishes an RSA key, aud2 an EC key
        let rsa = TestRecipient::rsa(Some("rsa-1"));
        let ec = TestRecipient::p256(Some("ec-1"));
        let issuer = issuer(
            vec![("aud1", Ok(key_set(&rsa))), ("aud2", Ok(key_set(&ec)))],
            Some(Arc::new(InMemoryCredentialStore::new())),
        );
        let principal = Principal::new("alice");
        let audiences = strings(&["aud1", "aud2"]);

        // WHEN: issuing twice
        let first = issuer.issue(Some(&audiences), None, &principal).await.unwrap();
        let second = issuer.issue(Some(&audiences), None, &principal).await.unwrap();

        // THEN: raw secrets are stable, envelopes differ, both decrypt to the secret
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.raw_secret(), b.raw_secret());
            assert_ne!(a.envelope().unwrap().as_str(), b.envelope().unwrap().as_str());
        }
        let recipients = [&rsa, &ec];
        for entries in [&first, &second] {
            for (entry, recipient) in entries.iter().zip(recipients) {
                let opened = test_support::open(entry.envelope().unwrap().as_str(), recipient);
                assert_eq!(opened, entry.raw_secret().unwrap().as_bytes());
            }
        }
    }

    #[tokio::test]
    async fn algorithms_follow_key_type() {
        let rsa = TestRecipient::rsa(Some("rsa-1"));
        let ec = TestRecipient::p384(None);
        let issuer = issuer(
            vec![("aud1", Ok(key_set(&rsa))), ("aud2", Ok(key_set(&ec)))],
            Some(Arc::new(InMemoryCredentialStore::new())),
        );

        let entries = issuer
            .issue(Some(&strings(&["aud1", "aud2"])), None, &Principal::new("alice"))
            .await
            .unwrap();

        let rsa_header = test_support::header(entries[0].envelope().unwrap().as_str());
        assert_eq!(rsa_header["alg"], "RSA-OAEP");
        assert_eq!(rsa_header["enc"], "A128GCM");
        assert_eq!(rsa_header["kid"], "rsa-1");
        let ec_header = test_support::header(entries[1].envelope().unwrap().as_str());
        assert_eq!(ec_header["alg"], "ECDH-ES+A128KW");
        assert_eq!(ec_header["enc"], "A192GCM");
        assert_eq!(ec_header["epk"]["crv"], "P-384");
        assert!(ec_header.get("kid").is_none());
    }

    #[tokio::test]
    async fn failures_are_isolated_per_candidate() {
        // GIVEN: aud1 works, aud2 times out, aud3 publishes an unsupported key
        let rsa = TestRecipient::rsa(None);
        let okp = Bytes::from(
            r#"{"keys":[{"kty":"OKP","use":"enc","crv":"X25519","x":"AA"}]}"#,
        );
        let issuer = issuer(
            vec![
                ("aud1", Ok(key_set(&rsa))),
                ("aud2", Err(RetrievalError::Timeout("aud2".to_string()))),
                ("aud3", Ok(okp)),
            ],
            Some(Arc::new(InMemoryCredentialStore::new())),
        );

        // WHEN: issuing to all three
        let entries = issuer
            .issue(
                Some(&strings(&["aud1", "aud2", "aud3"])),
                None,
                &Principal::new("alice"),
            )
            .await
            .unwrap();

        // THEN: all three are returned with secrets, only aud1 has an envelope
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.raw_secret().is_some()));
        assert!(entries[0].has_envelope());
        assert!(!entries[1].has_envelope());
        assert!(matches!(
            entries[1].outcome(),
            Some(EncryptionOutcome::RetrievalFailed(_))
        ));
        assert!(!entries[2].has_envelope());
        assert!(matches!(
            entries[2].outcome(),
            Some(EncryptionOutcome::UnsupportedKeyType(kty)) if kty == "OKP"
        ));
    }

    #[tokio::test]
    async fn key_set_without_encryption_key_yields_no_envelope() {
        let signing_only = Bytes::from(r#"{"keys":[{"kty":"RSA","use":"sig","n":"AQAB","e":"AQAB"}]}"#);
        let issuer = issuer(
            vec![("aud1", Ok(signing_only))],
            Some(Arc::new(InMemoryCredentialStore::new())),
        );

        let entries = issuer
            .issue(Some(&strings(&["aud1"])), None, &Principal::new("alice"))
            .await
            .unwrap();

        assert!(matches!(
            entries[0].outcome(),
            Some(EncryptionOutcome::NoEncryptionKey)
        ));
    }

    #[tokio::test]
    async fn result_order_follows_hints_not_completion() {
        let rsa = TestRecipient::rsa(None);
        let issuer = issuer(
            vec![
                ("aud1", Ok(key_set(&rsa))),
                ("aud2", Ok(key_set(&rsa))),
                ("aud3", Ok(key_set(&rsa))),
            ],
            Some(Arc::new(InMemoryCredentialStore::new())),
        )
        .with_max_concurrency(3);

        let entries = issuer
            .issue(
                Some(&strings(&["aud3", "aud1"])),
                Some(&strings(&["res2"])),
                &Principal::new("alice"),
            )
            .await
            .unwrap();

        let audiences: Vec<_> = entries.iter().map(CandidateEntry::audience).collect();
        assert_eq!(audiences, ["aud3", "aud1", "aud2"]);
    }

    #[tokio::test]
    async fn without_store_servers_are_listed_without_secrets() {
        let issuer = issuer(vec![], None);

        let entries = issuer
            .issue(Some(&strings(&["aud1"])), None, &Principal::new("alice"))
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert!(entries[0].raw_secret().is_none());
        assert!(matches!(entries[0].outcome(), Some(EncryptionOutcome::NoSecret)));
    }

    #[tokio::test]
    async fn cancellation_discards_partial_results() {
        // GIVEN: a key-set endpoint that never answers
        let registry = ResourceServerRegistry::new([server("aud1", &[])]).unwrap();
        let issuer = SecretIssuer::new(
            Arc::new(registry),
            SecretStoreAdapter::new(Some(Arc::new(InMemoryCredentialStore::new()))),
            KeyResolver::new(Arc::new(PendingRetriever), FetchLimits::default()),
        );
        let cancel = CancellationToken::new();

        // WHEN: the request is cancelled while the fetch is in flight
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = issuer
            .issue_with_cancellation(
                Some(&strings(&["aud1"])),
                None,
                &Principal::new("alice"),
                &cancel,
            )
            .await;

        // THEN: the request fails as cancelled
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn claims_hold_only_sealed_entries() {
        let rsa = TestRecipient::rsa(None);
        let sealed_envelope = envelope::seal(
            b"secret",
            &rsa.public_jwk(),
            select_header(&rsa.public_jwk()).unwrap(),
        )
        .unwrap();
        let sealed = CandidateEntry::new(Arc::new(server("aud1", &[])))
            .with_raw_secret("secret".to_string())
            .with_outcome(EncryptionOutcome::Encrypted(sealed_envelope.clone()));
        let skipped = CandidateEntry::new(Arc::new(server("aud2", &[])))
            .with_raw_secret("other".to_string())
            .with_outcome(EncryptionOutcome::NoEncryptionKey);

        let entries = [sealed, skipped];
        let claims = secret_claims(&entries);
        let issued: Vec<IssuedSecret> = entries.iter().map(CandidateEntry::to_issued).collect();

        assert_eq!(claims.len(), 1);
        assert_eq!(claims["aud1"], sealed_envelope.as_str());
        assert_eq!(issued[1].encrypted_secret, None);
        assert_eq!(
            serde_json::to_value(&issued[1]).unwrap(),
            serde_json::json!({ "audience": "aud2" })
        );
    }

    #[test]
    fn candidate_debug_hides_secret() {
        let entry = CandidateEntry::new(Arc::new(server("aud1", &[])))
            .with_raw_secret("plaintext-secret".to_string());

        let debug = format!("{entry:?}");

        assert!(debug.contains("aud1"));
        assert!(!debug.contains("plaintext-secret"));
    }
}
