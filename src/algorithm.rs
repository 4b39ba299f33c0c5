//! Algorithm selection for discovered encryption keys.
//!
//! | Key type | `alg` | `enc` |
//! |----------|-------|-------|
//! | `RSA` | `RSA-OAEP` | `A128GCM` |
//! | `EC` | `ECDH-ES+A128KW` | `A192GCM` |
//! | other | unsupported | unsupported |

use std::fmt;

use serde::Serialize;

use crate::key_resolver::DiscoveredKey;

/// JWK key type (`kty`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    /// `RSA`
    Rsa,
    /// `EC`
    Ec,
    /// Anything else (`oct`, `OKP`, unknown values)
    Other(String),
}

impl KeyType {
    /// Classify a `kty` member value.
    #[must_use]
    pub fn from_kty(kty: &str) -> Self {
        match kty {
            "RSA" => Self::Rsa,
            "EC" => Self::Ec,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa => f.write_str("RSA"),
            Self::Ec => f.write_str("EC"),
            Self::Other(kty) => f.write_str(kty),
        }
    }
}

/// Key-encryption algorithm (JWE `alg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyEncryptionAlgorithm {
    /// RSAES-OAEP with SHA-1 and MGF1-SHA-1
    #[serde(rename = "RSA-OAEP")]
    RsaOaep,
    /// Ephemeral-static ECDH with AES-128 key wrap
    #[serde(rename = "ECDH-ES+A128KW")]
    EcdhEsA128Kw,
}

impl KeyEncryptionAlgorithm {
    /// Registered JOSE name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RsaOaep => "RSA-OAEP",
            Self::EcdhEsA128Kw => "ECDH-ES+A128KW",
        }
    }
}

/// Content-encryption method (JWE `enc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentEncryptionMethod {
    /// AES-GCM with a 128-bit key
    #[serde(rename = "A128GCM")]
    A128Gcm,
    /// AES-GCM with a 192-bit key
    #[serde(rename = "A192GCM")]
    A192Gcm,
}

impl ContentEncryptionMethod {
    /// Registered JOSE name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A192Gcm => "A192GCM",
        }
    }

    /// Content-encryption key length in bytes.
    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::A128Gcm => 16,
            Self::A192Gcm => 24,
        }
    }
}

/// The algorithm pair written into an envelope's protected header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JweAlgorithms {
    /// Key-encryption algorithm
    pub alg: KeyEncryptionAlgorithm,
    /// Content-encryption method
    pub enc: ContentEncryptionMethod,
}

impl fmt::Display for JweAlgorithms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.alg.as_str(), self.enc.as_str())
    }
}

/// Pick the algorithm pair for a discovered key, or `None` if its key type
/// is not supported.
#[must_use]
pub fn select_header(key: &DiscoveredKey) -> Option<JweAlgorithms> {
    select_for_key_type(&key.key_type())
}

/// Pick the algorithm pair for a key type.
#[must_use]
pub fn select_for_key_type(key_type: &KeyType) -> Option<JweAlgorithms> {
    match key_type {
        KeyType::Rsa => Some(JweAlgorithms {
            alg: KeyEncryptionAlgorithm::RsaOaep,
            enc: ContentEncryptionMethod::A128Gcm,
        }),
        KeyType::Ec => Some(JweAlgorithms {
            alg: KeyEncryptionAlgorithm::EcdhEsA128Kw,
            enc: ContentEncryptionMethod::A192Gcm,
        }),
        KeyType::Other(_) => None,
    }
}
