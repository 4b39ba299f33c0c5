//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default connect timeout for key-set retrieval
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Default read timeout for key-set retrieval
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Default deadline for one whole key-set retrieval
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default key-set response size cap (50 KiB)
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 50 * 1024;

/// Default length of a generated per-user secret
pub const DEFAULT_SECRET_LENGTH: usize = 16;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Key-set retrieval settings
    pub key_resolver: KeyResolverConfig,
    /// Secret generation settings
    pub secrets: SecretsConfig,
    /// Issuance pipeline settings
    pub issuance: IssuanceConfig,
    /// Credential persistence settings
    pub credential_store: CredentialStoreConfig,
    /// Resource servers known to this deployment
    pub resource_servers: Vec<ResourceServerConfig>,
}

/// Key-set retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyResolverConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Read timeout (per read on the response body)
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Deadline for a whole retrieval, so a slow trickle cannot hold a request
    #[serde(with = "humantime_serde")]
    pub total_timeout: Duration,
    /// Maximum accepted key-set document size (bytes)
    pub max_response_bytes: usize,
    /// How long a fetched key set is reused; zero disables caching
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Reject non-HTTPS key-set locations
    pub require_https: bool,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            cache_ttl: Duration::from_secs(300),
            require_https: true,
        }
    }
}

/// Secret generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Length of newly generated secrets (characters)
    pub length: usize,
    /// Serialize credential read-modify-write per principal within this process
    pub serialize_per_principal: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_SECRET_LENGTH,
            serialize_per_principal: true,
        }
    }
}

/// Issuance pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Upper bound on concurrent per-candidate key fetches in one request
    pub max_concurrency: usize,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CredentialStoreConfig {
    /// Directory holding one credential file per principal.
    /// Supports `~` expansion. When unset, no secrets are issued.
    pub directory: Option<String>,
}

impl CredentialStoreConfig {
    /// Resolve the configured directory, expanding a leading `~`.
    #[must_use]
    pub fn resolved_directory(&self) -> Option<PathBuf> {
        let dir = self.directory.as_deref()?;
        if let Some(rest) = dir.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return Some(home.join(rest.trim_start_matches('/')));
            }
        }
        Some(PathBuf::from(dir))
    }
}

/// One resource server entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceServerConfig {
    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,
    /// Audience identifier (unique)
    pub audience: String,
    /// Resource-endpoint identifiers this server answers for
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Location of the server's published JSON key set
    pub jwks_url: String,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (STS_ prefix)
        figment = figment.merge(Env::prefixed("STS_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    fn validate(&self) -> Result<()> {
        if self.secrets.length == 0 {
            return Err(Error::Config("secrets.length must be at least 1".to_string()));
        }
        if self.issuance.max_concurrency == 0 {
            return Err(Error::Config(
                "issuance.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.key_resolver.total_timeout.is_zero() {
            return Err(Error::Config(
                "key_resolver.total_timeout must be non-zero".to_string(),
            ));
        }
        if self.key_resolver.max_response_bytes == 0 {
            return Err(Error::Config(
                "key_resolver.max_response_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
