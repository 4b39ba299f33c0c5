//! File-backed credential store.
//!
//! One JSON file per principal under a base directory, named by a hash of
//! the principal so identifiers never reach the filesystem.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::debug;

use super::{CredentialStore, Principal, UserCredentials};
use crate::{Error, Result};

/// Persists each principal's [`UserCredentials`] as a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    base_dir: PathBuf,
}

impl FileCredentialStore {
    /// Store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir).map_err(|e| {
                Error::CredentialStore(format!(
                    "Failed to create credential directory {}: {e}",
                    base_dir.display()
                ))
            })?;
        }
        Ok(Self { base_dir })
    }

    /// Base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn storage_key(principal: &Principal) -> String {
        let hash = Sha256::digest(principal.as_str().as_bytes());
        hex::encode(hash.as_slice())
    }

    fn credentials_path(&self, principal: &Principal) -> PathBuf {
        self.base_dir
            .join(format!("{}.json", Self::storage_key(principal)))
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, principal: &Principal) -> Result<UserCredentials> {
        let path = self.credentials_path(principal);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(principal = %principal, "No stored credentials found");
                return Ok(UserCredentials::default());
            }
            Err(e) => {
                return Err(Error::CredentialStore(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        serde_json::from_slice(&content).map_err(|e| {
            Error::CredentialStore(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    async fn store(&self, principal: &Principal, credentials: &UserCredentials) -> Result<()> {
        let path = self.credentials_path(principal);
        let base_dir = self.base_dir.clone();

        let content = serde_json::to_vec_pretty(credentials)
            .map_err(|e| Error::CredentialStore(format!("Failed to serialize credentials: {e}")))?;

        // Each write gets its own temp file, created owner-only (0600 on
        // unix), and is swapped in with an atomic rename.
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&base_dir)?;
            tmp.write_all(&content)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("Credential write task failed: {e}")))?
        .map_err(|e| {
            Error::CredentialStore(format!("Failed to write {}: {e}", path.display()))
        })?;

        debug!(principal = %principal, secrets = credentials.len(), "Saved credentials");
        Ok(())
    }
}
