//! Audit logging for secret lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with a JSON payload, making
//! the audit trail queryable by any log aggregator. Raw secrets never appear
//! in an event.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `secret.created` | A per-user secret was generated for a resource server |
//! | `secret.rotated` | A stored secret was dropped so the next issuance creates a new one |
//! | `secret.encrypted` | An envelope was produced for a resource server |
//! | `secret.skipped` | A resource server received no envelope |

use serde::Serialize;

use crate::envelope::EncryptedEnvelope;
use crate::secret_store::Principal;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"secret.created"`).
    pub event: &'static str,
    /// Principal the secret belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Resource server audience.
    pub audience: String,
    /// Recipient key id (for `secret.encrypted`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Key-encryption algorithm (for `secret.encrypted`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<&'static str>,
    /// Content-encryption method (for `secret.encrypted`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enc: Option<&'static str>,
    /// Why no envelope was produced (for `secret.skipped`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn base(event: &'static str, principal: Option<&Principal>, audience: &str) -> Self {
        Self {
            event,
            principal: principal.map(|p| p.as_str().to_string()),
            audience: audience.to_string(),
            kid: None,
            alg: None,
            enc: None,
            reason: None,
        }
    }

    /// Construct a `secret.created` event.
    #[must_use]
    pub fn created(principal: &Principal, audience: &str) -> Self {
        Self::base("secret.created", Some(principal), audience)
    }

    /// Construct a `secret.rotated` event.
    #[must_use]
    pub fn rotated(principal: &Principal, audience: &str) -> Self {
        Self::base("secret.rotated", Some(principal), audience)
    }

    /// Construct a `secret.encrypted` event.
    #[must_use]
    pub fn encrypted(principal: &Principal, audience: &str, envelope: &EncryptedEnvelope) -> Self {
        let algorithms = envelope.algorithms();
        Self {
            kid: envelope.kid().map(str::to_string),
            alg: Some(algorithms.alg.as_str()),
            enc: Some(algorithms.enc.as_str()),
            ..Self::base("secret.encrypted", Some(principal), audience)
        }
    }

    /// Construct a `secret.skipped` event.
    #[must_use]
    pub fn skipped(principal: &Principal, audience: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::base("secret.skipped", Some(principal), audience)
        }
    }
}

/// Emit an audit event via `tracing`.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "secret issuance audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
