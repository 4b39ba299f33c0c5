//! Resource server registry.
//!
//! Holds every resource server known to the deployment behind two independent
//! indexes: audience identifier and resource-endpoint identifier. The registry
//! is built once from configuration and is read-only afterwards; lookups hand
//! out shared [`Arc`] references rather than copies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use url::Url;

use crate::config::ResourceServerConfig;
use crate::{Error, Result};

/// A downstream service that accepts issued credentials and publishes an
/// encryption key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceServer {
    /// Optional display name.
    pub name: Option<String>,
    /// Audience identifier, unique within the registry.
    pub audience: String,
    /// Resource-endpoint identifiers this server answers for.
    pub endpoints: Vec<String>,
    /// Key-set discovery location.
    pub jwks_url: Url,
}

impl ResourceServer {
    /// Build a resource server from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the audience is empty or the key-set
    /// location is not an absolute URL.
    pub fn from_config(config: &ResourceServerConfig) -> Result<Self> {
        if config.audience.trim().is_empty() {
            return Err(Error::Config(
                "resource server audience must not be empty".to_string(),
            ));
        }
        let jwks_url = Url::parse(&config.jwks_url).map_err(|e| {
            Error::Config(format!(
                "invalid jwks_url for audience '{}': {e}",
                config.audience
            ))
        })?;

        Ok(Self {
            name: config.name.clone(),
            audience: config.audience.clone(),
            endpoints: config.endpoints.clone(),
            jwks_url,
        })
    }

    /// Name for display: the configured name, falling back to the audience.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.audience)
    }
}

/// Registry indexed by audience and by resource endpoint.
#[derive(Debug, Default)]
pub struct ResourceServerRegistry {
    servers: Vec<Arc<ResourceServer>>,
    by_audience: HashMap<String, Arc<ResourceServer>>,
    by_endpoint: HashMap<String, Arc<ResourceServer>>,
}

impl ResourceServerRegistry {
    /// Build the registry, rejecting duplicate audiences and endpoints that
    /// would point at two different servers.
    pub fn new(servers: impl IntoIterator<Item = ResourceServer>) -> Result<Self> {
        let mut registry = Self::default();

        for server in servers {
            let server = Arc::new(server);

            if registry.by_audience.contains_key(&server.audience) {
                return Err(Error::Config(format!(
                    "duplicate resource server audience '{}'",
                    server.audience
                )));
            }

            for endpoint in &server.endpoints {
                if let Some(existing) = registry.by_endpoint.get(endpoint) {
                    if existing.audience != server.audience {
                        return Err(Error::Config(format!(
                            "endpoint '{endpoint}' is claimed by both '{}' and '{}'",
                            existing.audience, server.audience
                        )));
                    }
                }
                registry
                    .by_endpoint
                    .insert(endpoint.clone(), Arc::clone(&server));
            }

            registry
                .by_audience
                .insert(server.audience.clone(), Arc::clone(&server));
            registry.servers.push(server);
        }

        Ok(registry)
    }

    /// Build the registry from configuration entries.
    pub fn from_config(configs: &[ResourceServerConfig]) -> Result<Self> {
        let servers = configs
            .iter()
            .map(ResourceServer::from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::new(servers)
    }

    /// Look up servers by audience hints, in hint order.
    ///
    /// Unknown audiences are skipped. A server named twice is returned once.
    #[must_use]
    pub fn resolve_by_audiences<S: AsRef<str>>(&self, audiences: &[S]) -> Vec<Arc<ResourceServer>> {
        lookup(&self.by_audience, audiences)
    }

    /// Look up servers by resource-endpoint hints, in hint order.
    ///
    /// Unknown endpoints are skipped. A server named twice is returned once.
    #[must_use]
    pub fn resolve_by_endpoints<S: AsRef<str>>(&self, endpoints: &[S]) -> Vec<Arc<ResourceServer>> {
        lookup(&self.by_endpoint, endpoints)
    }

    /// Look up a single server by audience.
    #[must_use]
    pub fn get(&self, audience: &str) -> Option<&Arc<ResourceServer>> {
        self.by_audience.get(audience)
    }

    /// All registered servers, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceServer>> {
        self.servers.iter()
    }

    /// Number of registered servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

fn lookup<S: AsRef<str>>(
    index: &HashMap<String, Arc<ResourceServer>>,
    keys: &[S],
) -> Vec<Arc<ResourceServer>> {
    dedup_servers(keys.iter().filter_map(|k| index.get(k.as_ref()).cloned()))
}

/// Collapse servers to one entry per audience, keeping first-seen order.
///
/// Audience is unique within a registry, so it serves as server identity.
pub fn dedup_servers(
    servers: impl IntoIterator<Item = Arc<ResourceServer>>,
) -> Vec<Arc<ResourceServer>> {
    let mut seen = HashSet::new();
    servers
        .into_iter()
        .filter(|s| seen.insert(s.audience.clone()))
        .collect()
}
