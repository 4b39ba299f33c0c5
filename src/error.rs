//! Error types for secret issuance

use thiserror::Error;

/// Result type alias for secret issuance
pub type Result<T> = std::result::Result<T, Error>;

/// Systemic errors.
///
/// Per-resource-server failures (key retrieval, unsupported key types,
/// encryption) never surface here; they are recorded on the candidate as an
/// [`EncryptionOutcome`](crate::issuance::EncryptionOutcome).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential store load or store failed
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// The issuance request was cancelled before completion
    #[error("Issuance cancelled")]
    Cancelled,

    /// A background task failed to complete
    #[error("Internal error: {0}")]
    Internal(String),
}
