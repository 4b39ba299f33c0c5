//! JWE envelopes for per-resource-server secrets.
//!
//! An envelope is a JWE in compact serialization:
//!
//! ```text
//! BASE64URL(header) . BASE64URL(encrypted key) . BASE64URL(iv) . BASE64URL(ciphertext) . BASE64URL(tag)
//! ```
//!
//! A fresh content-encryption key and IV are drawn for every envelope, so two
//! envelopes of the same secret under the same key never match.
//!
//! # Key management
//!
//! - `RSA-OAEP`: the content key is encrypted with RSAES-OAEP (SHA-1, MGF1-SHA-1).
//! - `ECDH-ES+A128KW`: an ephemeral key pair on the recipient's curve is agreed
//!   with the recipient key, the Concat KDF (SHA-256) derives a 128-bit
//!   wrapping key, and the content key is wrapped with AES key wrap. The
//!   ephemeral public key travels in the `epk` header member. P-256 and P-384
//!   are supported.

#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;

use aes_gcm::Aes128Gcm;
use aes_gcm::AesGcm;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_kw::KekAes128;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, RngCore};
use rsa::{BigUint, Oaep, RsaPublicKey};
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::algorithm::{ContentEncryptionMethod, JweAlgorithms, KeyEncryptionAlgorithm};
use crate::key_resolver::DiscoveredKey;

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEK_LEN: usize = 16;

/// Failure to build an envelope from a key and algorithm pair.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeError {
    /// Key material is missing, malformed, or does not fit the algorithm.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// The EC key's curve has no ECDH-ES implementation here.
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// A cryptographic primitive failed.
    #[error("Encryption failed: {0}")]
    Crypto(String),
}

type EnvelopeResult<T> = std::result::Result<T, EnvelopeError>;

/// A sealed secret, ready to embed in a token claim.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    compact: String,
    kid: Option<String>,
    algorithms: JweAlgorithms,
}

impl EncryptedEnvelope {
    /// Compact serialization.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.compact
    }

    /// `kid` of the recipient key, if it had one.
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Algorithm pair recorded in the header.
    #[must_use]
    pub fn algorithms(&self) -> JweAlgorithms {
        self.algorithms
    }
}

impl fmt::Display for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compact)
    }
}

impl fmt::Debug for EncryptedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedEnvelope")
            .field("kid", &self.kid)
            .field("algorithms", &self.algorithms)
            .field("len", &self.compact.len())
            .finish()
    }
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: KeyEncryptionAlgorithm,
    enc: ContentEncryptionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    epk: Option<EphemeralPublicKey>,
}

#[derive(Debug, Serialize)]
struct EphemeralPublicKey {
    kty: &'static str,
    crv: String,
    x: String,
    y: String,
}

/// Encrypt `plaintext` to `key` under `algorithms`.
///
/// # Errors
///
/// Returns [`EnvelopeError`] if the key does not fit the algorithm, its
/// material cannot be decoded, or a primitive fails.
pub fn seal(
    plaintext: &[u8],
    key: &DiscoveredKey,
    algorithms: JweAlgorithms,
) -> EnvelopeResult<EncryptedEnvelope> {
    let mut cek = vec![0u8; algorithms.enc.key_len()];
    OsRng.fill_bytes(&mut cek);

    let (encrypted_key, epk) = match algorithms.alg {
        KeyEncryptionAlgorithm::RsaOaep => (rsa_oaep_encrypt(key, &cek)?, None),
        KeyEncryptionAlgorithm::EcdhEsA128Kw => {
            let (kek, epk) = ecdh_es_key_agreement(key, algorithms.alg)?;
            let wrapped = KekAes128::from(kek)
                .wrap_vec(&cek)
                .map_err(|e| EnvelopeError::Crypto(format!("AES key wrap: {e}")))?;
            (wrapped, Some(epk))
        }
    };

    let header = ProtectedHeader {
        alg: algorithms.alg,
        enc: algorithms.enc,
        kid: key.kid.as_deref(),
        epk,
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| EnvelopeError::Crypto(e.to_string()))?;
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json);

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let (ciphertext, tag) =
        aes_gcm_encrypt(algorithms.enc, &cek, &iv, plaintext, header_b64.as_bytes())?;

    let compact = format!(
        "{header_b64}.{}.{}.{}.{}",
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    );

    Ok(EncryptedEnvelope {
        compact,
        kid: key.kid.clone(),
        algorithms,
    })
}

fn rsa_oaep_encrypt(key: &DiscoveredKey, cek: &[u8]) -> EnvelopeResult<Vec<u8>> {
    if key.kty != "RSA" {
        return Err(EnvelopeError::InvalidKey(format!(
            "RSA-OAEP needs an RSA key, got '{}'",
            key.kty
        )));
    }
    let n = DiscoveredKey::decode_member(key.n.as_deref(), "n").map_err(EnvelopeError::InvalidKey)?;
    let e = DiscoveredKey::decode_member(key.e.as_deref(), "e").map_err(EnvelopeError::InvalidKey)?;

    let public = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| EnvelopeError::InvalidKey(e.to_string()))?;

    public
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), cek)
        .map_err(|e| EnvelopeError::Crypto(format!("RSA-OAEP: {e}")))
}

/// Ephemeral-static agreement on the recipient's curve.
///
/// Expands to `(shared_secret, ephemeral_x, ephemeral_y)`.
macro_rules! ecdh_agree {
    ($curve:ident, $x:expr, $y:expr) => {{
        use $curve::elliptic_curve::sec1::ToEncodedPoint;

        let mut sec1 = Vec::with_capacity(1 + $x.len() + $y.len());
        sec1.push(0x04);
        sec1.extend_from_slice(&$x);
        sec1.extend_from_slice(&$y);
        let recipient = $curve::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| EnvelopeError::InvalidKey("EC point is not on the curve".to_string()))?;

        let ephemeral = $curve::ecdh::EphemeralSecret::random(&mut OsRng);
        let shared = ephemeral.diffie_hellman(&recipient);
        let point = ephemeral.public_key().to_encoded_point(false);
        let (Some(ex), Some(ey)) = (point.x(), point.y()) else {
            return Err(EnvelopeError::Crypto("ephemeral key has no affine coordinates".to_string()));
        };

        (shared.raw_secret_bytes().to_vec(), ex.to_vec(), ey.to_vec())
    }};
}

fn ecdh_es_key_agreement(
    key: &DiscoveredKey,
    alg: KeyEncryptionAlgorithm,
) -> EnvelopeResult<([u8; KEK_LEN], EphemeralPublicKey)> {
    if key.kty != "EC" {
        return Err(EnvelopeError::InvalidKey(format!(
            "ECDH-ES needs an EC key, got '{}'",
            key.kty
        )));
    }
    let crv = key
        .crv
        .as_deref()
        .ok_or_else(|| EnvelopeError::InvalidKey("missing 'crv' member".to_string()))?;
    let x = DiscoveredKey::decode_member(key.x.as_deref(), "x").map_err(EnvelopeError::InvalidKey)?;
    let y = DiscoveredKey::decode_member(key.y.as_deref(), "y").map_err(EnvelopeError::InvalidKey)?;

    let (z, ex, ey) = match crv {
        "P-256" => ecdh_agree!(p256, x, y),
        "P-384" => ecdh_agree!(p384, x, y),
        other => return Err(EnvelopeError::UnsupportedCurve(other.to_string())),
    };

    let derived = concat_kdf(&z, alg.as_str(), &[], &[], KEK_LEN)?;
    let mut kek = [0u8; KEK_LEN];
    kek.copy_from_slice(&derived);

    let epk = EphemeralPublicKey {
        kty: "EC",
        crv: crv.to_string(),
        x: URL_SAFE_NO_PAD.encode(ex),
        y: URL_SAFE_NO_PAD.encode(ey),
    };
    Ok((kek, epk))
}

/// Concat KDF (NIST SP 800-56A) as profiled for ECDH-ES: SHA-256,
/// `SuppPubInfo` = key length in bits.
pub(crate) fn concat_kdf(
    z: &[u8],
    algorithm_id: &str,
    apu: &[u8],
    apv: &[u8],
    key_len: usize,
) -> EnvelopeResult<Vec<u8>> {
    let length_prefix = |len: usize| {
        u32::try_from(len)
            .map(u32::to_be_bytes)
            .map_err(|_| EnvelopeError::Crypto("Concat KDF input too long".to_string()))
    };

    let mut derived = Vec::with_capacity(key_len);
    let mut counter: u32 = 1;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(z);
        hasher.update(length_prefix(algorithm_id.len())?);
        hasher.update(algorithm_id.as_bytes());
        hasher.update(length_prefix(apu.len())?);
        hasher.update(apu);
        hasher.update(length_prefix(apv.len())?);
        hasher.update(apv);
        hasher.update(length_prefix(key_len * 8)?);
        derived.extend_from_slice(hasher.finalize().as_slice());
        counter += 1;
    }
    derived.truncate(key_len);
    Ok(derived)
}

fn aes_gcm_encrypt(
    enc: ContentEncryptionMethod,
    cek: &[u8],
    iv: &[u8; IV_LEN],
    msg: &[u8],
    aad: &[u8],
) -> EnvelopeResult<(Vec<u8>, Vec<u8>)> {
    let nonce = GenericArray::from_slice(iv);
    let payload = Payload { msg, aad };
    let invalid_key = |_| EnvelopeError::Crypto("content key has the wrong length".to_string());

    let mut sealed = match enc {
        ContentEncryptionMethod::A128Gcm => Aes128Gcm::new_from_slice(cek)
            .map_err(invalid_key)?
            .encrypt(nonce, payload),
        ContentEncryptionMethod::A192Gcm => Aes192Gcm::new_from_slice(cek)
            .map_err(invalid_key)?
            .encrypt(nonce, payload),
    }
    .map_err(|_| EnvelopeError::Crypto("AES-GCM encryption failed".to_string()))?;

    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok((sealed, tag))
}
