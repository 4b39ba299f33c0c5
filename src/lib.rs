//! STS Resource Secrets
//!
//! Issues, for an authenticated principal, a per-resource-server shared
//! secret and delivers it to each resource server as a JWE sealed to that
//! server's published encryption key.
//!
//! # Features
//!
//! - **Registry**: resource servers indexed by audience and by endpoint
//! - **Secrets**: lazily created, stable per (principal, resource server), one
//!   credential write per request
//! - **Key discovery**: bounded key-set retrieval with a TTL cache
//! - **Envelopes**: `RSA-OAEP`/`A128GCM` and `ECDH-ES+A128KW`/`A192GCM`
//! - **Failure isolation**: one bad resource server never blocks the others

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod algorithm;
pub mod audit;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod issuance;
pub mod key_resolver;
pub mod resource_server;
pub mod secret_store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
        }
        _ => {
            subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
        }
    }

    Ok(())
}
