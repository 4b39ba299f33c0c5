//! In-process credential store.

use dashmap::DashMap;

use super::{CredentialStore, Principal, UserCredentials};
use crate::Result;

/// Credential store backed by a concurrent map. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    entries: DashMap<String, UserCredentials>,
}

impl InMemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of principals with stored credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, principal: &Principal) -> Result<UserCredentials> {
        Ok(self
            .entries
            .get(principal.as_str())
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn store(&self, principal: &Principal, credentials: &UserCredentials) -> Result<()> {
        self.entries
            .insert(principal.as_str().to_string(), credentials.clone());
        Ok(())
    }
}
