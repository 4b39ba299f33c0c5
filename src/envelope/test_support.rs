//! Test-only recipients that can open envelopes.

use std::sync::OnceLock;

use aes_gcm::Aes128Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_kw::KekAes128;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

use super::{Aes192Gcm, concat_kdf};
use crate::key_resolver::DiscoveredKey;

/// A private key able to open envelopes sealed to its public half.
pub(crate) enum TestRecipient {
    Rsa(RsaPrivateKey, Option<String>),
    P256(p256::SecretKey, Option<String>),
    P384(p384::SecretKey, Option<String>),
}

fn shared_rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
}

impl TestRecipient {
    pub(crate) fn rsa(kid: Option<&str>) -> Self {
        Self::Rsa(shared_rsa_key().clone(), kid.map(str::to_string))
    }

    pub(crate) fn p256(kid: Option<&str>) -> Self {
        Self::P256(p256::SecretKey::random(&mut OsRng), kid.map(str::to_string))
    }

    pub(crate) fn p384(kid: Option<&str>) -> Self {
        Self::P384(p384::SecretKey::random(&mut OsRng), kid.map(str::to_string))
    }

    /// Public half as it would appear in a key set with `"use": "enc"`.
    pub(crate) fn public_jwk(&self) -> DiscoveredKey {
        let blank = |kty: &str, kid: &Option<String>| DiscoveredKey {
            kty: kty.to_string(),
            key_use: Some("enc".to_string()),
            kid: kid.clone(),
            alg: None,
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        };

        match self {
            Self::Rsa(key, kid) => DiscoveredKey {
                n: Some(URL_SAFE_NO_PAD.encode(key.n().to_bytes_be())),
                e: Some(URL_SAFE_NO_PAD.encode(key.e().to_bytes_be())),
                ..blank("RSA", kid)
            },
            Self::P256(key, kid) => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                let point = key.public_key().to_encoded_point(false);
                DiscoveredKey {
                    crv: Some("P-256".to_string()),
                    x: point.x().map(|c| URL_SAFE_NO_PAD.encode(c)),
                    y: point.y().map(|c| URL_SAFE_NO_PAD.encode(c)),
                    ..blank("EC", kid)
                }
            }
            Self::P384(key, kid) => {
                use p384::elliptic_curve::sec1::ToEncodedPoint;
                let point = key.public_key().to_encoded_point(false);
                DiscoveredKey {
                    crv: Some("P-384".to_string()),
                    x: point.x().map(|c| URL_SAFE_NO_PAD.encode(c)),
                    y: point.y().map(|c| URL_SAFE_NO_PAD.encode(c)),
                    ..blank("EC", kid)
                }
            }
        }
    }
}

/// Decode the protected header of a compact JWE.
pub(crate) fn header(compact: &str) -> serde_json::Value {
    let first = compact.split('.').next().unwrap();
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(first).unwrap()).unwrap()
}

fn epk_sec1(header: &serde_json::Value) -> Vec<u8> {
    let coord = |name: &str| URL_SAFE_NO_PAD.decode(header["epk"][name].as_str().unwrap()).unwrap();
    let mut sec1 = vec![0x04];
    sec1.extend(coord("x"));
    sec1.extend(coord("y"));
    sec1
}

fn unwrap_with_agreement(z: &[u8], encrypted_key: &[u8]) -> Vec<u8> {
    let kek = concat_kdf(z, "ECDH-ES+A128KW", &[], &[], 16).unwrap();
    let kek: [u8; 16] = kek.try_into().unwrap();
    KekAes128::from(kek).unwrap_vec(encrypted_key).unwrap()
}

/// Open a compact JWE produced by [`super::seal`], panicking on any failure.
pub(crate) fn open(compact: &str, recipient: &TestRecipient) -> Vec<u8> {
    let parts: Vec<&str> = compact.split('.').collect();
    assert_eq!(parts.len(), 5, "compact JWE has five parts");
    let decode = |i: usize| URL_SAFE_NO_PAD.decode(parts[i]).unwrap();
    let header = header(compact);
    let encrypted_key = decode(1);

    let cek = match recipient {
        TestRecipient::Rsa(key, _) => {
            assert_eq!(header["alg"], "RSA-OAEP");
            key.decrypt(Oaep::new::<Sha1>(), &encrypted_key).unwrap()
        }
        TestRecipient::P256(key, _) => {
            assert_eq!(header["alg"], "ECDH-ES+A128KW");
            let epk = p256::PublicKey::from_sec1_bytes(&epk_sec1(&header)).unwrap();
            let shared = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), epk.as_affine());
            unwrap_with_agreement(shared.raw_secret_bytes(), &encrypted_key)
        }
        TestRecipient::P384(key, _) => {
            assert_eq!(header["alg"], "ECDH-ES+A128KW");
            let epk = p384::PublicKey::from_sec1_bytes(&epk_sec1(&header)).unwrap();
            let shared = p384::ecdh::diffie_hellman(key.to_nonzero_scalar(), epk.as_affine());
            unwrap_with_agreement(shared.raw_secret_bytes(), &encrypted_key)
        }
    };

    let iv = decode(2);
    let mut sealed = decode(3);
    sealed.extend(decode(4));
    let nonce = GenericArray::from_slice(&iv);
    let payload = Payload {
        msg: &sealed,
        aad: parts[0].as_bytes(),
    };

    match header["enc"].as_str().unwrap() {
        "A128GCM" => Aes128Gcm::new_from_slice(&cek).unwrap().decrypt(nonce, payload),
        "A192GCM" => Aes192Gcm::new_from_slice(&cek).unwrap().decrypt(nonce, payload),
        other => panic!("unexpected enc {other}"),
    }
    .unwrap()
}
