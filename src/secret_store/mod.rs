//! Per-user secrets for resource servers.
//!
//! The [`CredentialStore`] trait abstracts the persistence collaborator that
//! owns each principal's [`UserCredentials`]. [`SecretStoreAdapter`] sits on
//! top of it and, for one issuance request:
//!
//! 1. loads the principal's credential set once,
//! 2. reuses the stored secret for every candidate that has one,
//! 3. generates a secret for every candidate that does not,
//! 4. persists the set once, and only if something was generated.
//!
//! # Concurrency
//!
//! Load-modify-store for one principal is not atomic in the store contract.
//! With `serialize_per_principal` enabled (the default) the adapter holds an
//! async mutex per principal across that sequence, so concurrent requests in
//! this process cannot both create a secret for the same audience. Separate
//! processes sharing one store still race, and the last store wins.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::Result;
use crate::audit::{self, AuditEvent};
use crate::config::{DEFAULT_SECRET_LENGTH, SecretsConfig};
use crate::issuance::CandidateEntry;

pub use file::FileCredentialStore;
pub use memory::InMemoryCredentialStore;

/// The authenticated entity secrets are issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    /// Wrap a principal identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Principal {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A principal's secrets, keyed by resource server audience.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

impl UserCredentials {
    /// Secret for `audience`, if one exists.
    #[must_use]
    pub fn get(&self, audience: &str) -> Option<&str> {
        self.secrets.get(audience).map(String::as_str)
    }

    /// Set the secret for `audience`.
    pub fn set(&mut self, audience: impl Into<String>, secret: impl Into<String>) {
        self.secrets.insert(audience.into(), secret.into());
    }

    /// Drop the secret for `audience`, returning whether one existed.
    pub fn remove(&mut self, audience: &str) -> bool {
        self.secrets.remove(audience).is_some()
    }

    /// Audiences with a stored secret.
    pub fn audiences(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    /// Number of stored secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether no secret is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("audiences", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Persistence collaborator for user credentials.
///
/// Implementations must be `Send + Sync` because one store is shared across
/// concurrent requests. Failures are systemic and abort the request.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Load a principal's credential set. A principal with nothing stored
    /// yields an empty set.
    async fn load(&self, principal: &Principal) -> Result<UserCredentials>;

    /// Replace a principal's credential set.
    async fn store(&self, principal: &Principal, credentials: &UserCredentials) -> Result<()>;
}

/// Source of new secrets.
pub trait SecretGenerator: Send + Sync {
    /// Produce an unpredictable secret of `length` characters.
    fn generate(&self, length: usize) -> String;
}

/// First printable, non-whitespace ASCII character (`!`).
const FIRST_GRAPHIC: u8 = 0x21;
/// Number of printable, non-whitespace ASCII characters (`!` ..= `~`).
const GRAPHIC_COUNT: u8 = 94;

/// Secrets drawn uniformly from printable, non-whitespace ASCII.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSecretGenerator;

impl SecretGenerator for RandomSecretGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::rng();
        let mut secret = String::with_capacity(length);
        while secret.len() < length {
            let byte: u8 = rng.random();
            // Rejecting 188..=255 keeps the modulo unbiased.
            if byte < GRAPHIC_COUNT * 2 {
                secret.push(char::from(FIRST_GRAPHIC + byte % GRAPHIC_COUNT));
            }
        }
        secret
    }
}

/// Whether `secret` consists only of printable, non-whitespace ASCII.
#[must_use]
pub fn is_graphic_secret(secret: &str) -> bool {
    secret.bytes().all(|b| b.is_ascii_graphic())
}

/// Obtains or lazily creates per-user-per-resource-server secrets.
pub struct SecretStoreAdapter {
    store: Option<Arc<dyn CredentialStore>>,
    generator: Arc<dyn SecretGenerator>,
    secret_length: usize,
    principal_locks: Option<DashMap<String, Arc<Mutex<()>>>>,
}

impl SecretStoreAdapter {
    /// Adapter over `store`. With `None`, candidates pass through without
    /// secrets.
    #[must_use]
    pub fn new(store: Option<Arc<dyn CredentialStore>>) -> Self {
        Self {
            store,
            generator: Arc::new(RandomSecretGenerator),
            secret_length: DEFAULT_SECRET_LENGTH,
            principal_locks: Some(DashMap::new()),
        }
    }

    /// Adapter over `store` with the configured secret length and locking.
    #[must_use]
    pub fn from_config(store: Option<Arc<dyn CredentialStore>>, config: &SecretsConfig) -> Self {
        Self::new(store)
            .with_secret_length(config.length)
            .with_per_principal_serialization(config.serialize_per_principal)
    }

    /// Replace the secret source.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn SecretGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Length of generated secrets.
    #[must_use]
    pub fn with_secret_length(mut self, length: usize) -> Self {
        self.secret_length = length;
        self
    }

    /// Enable or disable the per-principal mutex.
    #[must_use]
    pub fn with_per_principal_serialization(mut self, enabled: bool) -> Self {
        self.principal_locks = enabled.then(DashMap::new);
        self
    }

    /// Whether a credential store is configured.
    #[must_use]
    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Attach each candidate's raw secret, creating missing ones.
    ///
    /// Loads the credential set once and stores it at most once. Without a
    /// credential store the candidates are returned unchanged.
    ///
    /// # Errors
    ///
    /// Propagates credential store load or store failures.
    pub async fn resolve_secrets(
        &self,
        principal: &Principal,
        candidates: Vec<CandidateEntry>,
    ) -> Result<Vec<CandidateEntry>> {
        let Some(store) = &self.store else {
            debug!(principal = %principal, "No credential store configured, skipping secrets");
            return Ok(candidates);
        };

        let _guard = self.lock_principal(principal).await;
        let mut credentials = store.load(principal).await?;
        let mut created = Vec::new();

        let resolved: Vec<CandidateEntry> = candidates
            .into_iter()
            .map(|candidate| {
                let audience = candidate.audience();
                let secret = if let Some(existing) = credentials.get(audience) {
                    existing.to_string()
                } else {
                    let secret = self.generator.generate(self.secret_length);
                    credentials.set(audience, secret.clone());
                    created.push(audience.to_string());
                    secret
                };
                candidate.with_raw_secret(secret)
            })
            .collect();

        if !created.is_empty() {
            store.store(principal, &credentials).await?;
            for audience in &created {
                audit::emit(&AuditEvent::created(principal, audience));
            }
        }

        Ok(resolved)
    }

    /// Drop the stored secret for `audience` so the next issuance creates a
    /// new one. Returns whether a secret existed.
    ///
    /// # Errors
    ///
    /// Propagates credential store load or store failures.
    pub async fn rotate_secret(&self, principal: &Principal, audience: &str) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        let _guard = self.lock_principal(principal).await;
        let mut credentials = store.load(principal).await?;
        if !credentials.remove(audience) {
            return Ok(false);
        }
        store.store(principal, &credentials).await?;
        audit::emit(&AuditEvent::rotated(principal, audience));
        Ok(true)
    }

    async fn lock_principal(&self, principal: &Principal) -> Option<PrincipalGuard<'_>> {
        let locks = self.principal_locks.as_ref()?;
        let lock = Arc::clone(locks.entry(principal.as_str().to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        Some(PrincipalGuard {
            locks,
            principal: principal.as_str().to_string(),
            guard: Some(guard),
        })
    }
}

/// Holds a principal's mutex; removes the map entry once nobody else
/// references it.
struct PrincipalGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    principal: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PrincipalGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.principal, |_, lock| Arc::strong_count(lock) == 1);
    }
}
