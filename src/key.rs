//! Account and responder key pairs.

use std::fmt;

use p256::ecdsa::signature::{SignatureEncoding as _, Signer as _};
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use rsa::{pkcs1::DecodeRsaPrivateKey as _, traits::PublicKeyParts as _, RsaPrivateKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{error::CryptoError, jws::Jwk, util::base64url};

const RSA_MIN_BITS: usize = 2048;
const RSA_MAX_BITS: usize = 8192;

/// Parameters for [`AccountKey::generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    Rsa { bits: usize },
    Ec { curve: String },
}

impl KeySpec {
    /// The default: ECDSA over P-256.
    pub fn p256() -> Self {
        KeySpec::Ec {
            curve: "P-256".to_owned(),
        }
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        Self::p256()
    }
}

/// A private key that signs ACME requests.
///
/// Either ECDSA P-256 (`ES256`) or RSA (`RS256`).
#[derive(Clone)]
pub struct AccountKey {
    inner: KeyInner,
}

#[derive(Clone)]
enum KeyInner {
    Ec(p256::ecdsa::SigningKey),
    Rsa(RsaPrivateKey),
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("alg", &self.alg())
            .finish_non_exhaustive()
    }
}

impl AccountKey {
    pub fn generate(spec: &KeySpec) -> Result<AccountKey, CryptoError> {
        match spec {
            KeySpec::Ec { curve } if curve == "P-256" => {
                Ok(Self::from_ec(crate::cert::create_p256_key()))
            }

            KeySpec::Ec { curve } => Err(CryptoError::KeyGeneration(format!(
                "unsupported curve: {curve}"
            ))),

            KeySpec::Rsa { bits } if (RSA_MIN_BITS..=RSA_MAX_BITS).contains(bits) => {
                let key = RsaPrivateKey::new(&mut rand::thread_rng(), *bits)
                    .map_err(|err| CryptoError::KeyGeneration(err.to_string()))?;
                Ok(AccountKey {
                    inner: KeyInner::Rsa(key),
                })
            }

            KeySpec::Rsa { bits } => Err(CryptoError::KeyGeneration(format!(
                "RSA modulus must be {RSA_MIN_BITS} to {RSA_MAX_BITS} bits, got {bits}"
            ))),
        }
    }

    pub(crate) fn from_ec(signing_key: p256::ecdsa::SigningKey) -> AccountKey {
        AccountKey {
            inner: KeyInner::Ec(signing_key),
        }
    }

    /// Reads a PKCS#8, PKCS#1 (RSA) or SEC1 (EC) private key.
    pub fn from_pem(pem: &str) -> Result<AccountKey, CryptoError> {
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(Self::from_ec(key));
        }

        let rsa = RsaPrivateKey::from_pkcs8_pem(pem).or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem));
        if let Ok(key) = rsa {
            return Ok(AccountKey {
                inner: KeyInner::Rsa(key),
            });
        }

        p256::SecretKey::from_sec1_pem(pem)
            .map(|key| Self::from_ec(key.into()))
            .map_err(|_| CryptoError::Parse("unrecognized private key PEM".to_owned()))
    }

    /// Exports the key as PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        let pem = match &self.inner {
            KeyInner::Ec(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
            KeyInner::Rsa(key) => key.to_pkcs8_pem(pem::LineEnding::LF),
        };

        pem.map_err(|err| CryptoError::Encoding(err.to_string()))
    }

    /// Exports the key as PKCS#8 DER.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = match &self.inner {
            KeyInner::Ec(key) => key.to_pkcs8_der(),
            KeyInner::Rsa(key) => key.to_pkcs8_der(),
        }
        .map_err(|err| CryptoError::Encoding(err.to_string()))?;

        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// JWS algorithm used by [`sign`](Self::sign).
    pub fn alg(&self) -> &'static str {
        match self.inner {
            KeyInner::Ec(_) => "ES256",
            KeyInner::Rsa(_) => "RS256",
        }
    }

    /// Signs `msg`.
    ///
    /// ECDSA signatures are the fixed-size `r || s` concatenation used by JWS.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.inner {
            KeyInner::Ec(key) => {
                let sig: p256::ecdsa::Signature = key
                    .try_sign(msg)
                    .map_err(|err| CryptoError::InvalidSignature(err.to_string()))?;
                Ok(sig.to_bytes().to_vec())
            }

            KeyInner::Rsa(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                let sig = signer
                    .try_sign(msg)
                    .map_err(|err| CryptoError::InvalidSignature(err.to_string()))?;
                Ok(sig.to_vec())
            }
        }
    }

    /// Public half of the key as a JWK.
    pub fn jwk(&self) -> Jwk {
        match &self.inner {
            KeyInner::Ec(key) => {
                // uncompressed SEC1: 0x04 || x || y
                let point = key.verifying_key().to_encoded_point(false);
                let bytes = point.as_bytes();

                Jwk::Ec {
                    crv: "P-256".to_owned(),
                    x: base64url(&bytes[1..33]),
                    y: base64url(&bytes[33..65]),
                }
            }

            KeyInner::Rsa(key) => Jwk::Rsa {
                n: base64url(&key.n().to_bytes_be()),
                e: base64url(&key.e().to_bytes_be()),
            },
        }
    }

    /// RFC 7638 thumbprint of the public key.
    pub fn thumbprint(&self) -> String {
        self.jwk().thumbprint()
    }

    /// `token "." thumbprint`, the value a challenge responder publishes.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_rejects_bad_params() {
        let err = AccountKey::generate(&KeySpec::Ec {
            curve: "P-384".to_owned(),
        })
        .unwrap_err();
        assert!(matches!(err, CryptoError::KeyGeneration(_)));

        let err = AccountKey::generate(&KeySpec::Rsa { bits: 1024 }).unwrap_err();
        assert!(matches!(err, CryptoError::KeyGeneration(_)));
    }

    #[test]
    fn pem_roundtrip_keeps_thumbprint() {
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();
        let pem = key.to_pem().unwrap();
        let reloaded = AccountKey::from_pem(&pem).unwrap();

        assert_eq!(reloaded.alg(), "ES256");
        assert_eq!(key.thumbprint(), reloaded.thumbprint());
    }

    #[test]
    fn sec1_pem_is_accepted() {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let pem = secret.to_sec1_pem(pem::LineEnding::LF).unwrap();
        let key = AccountKey::from_pem(&pem).unwrap();
        assert_eq!(key.alg(), "ES256");
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        let err = AccountKey::from_pem("-----BEGIN NOTHING-----\nAAAA\n-----END NOTHING-----\n")
            .unwrap_err();
        assert!(matches!(err, CryptoError::Parse(_)));
    }

    #[test]
    fn es256_signature_is_raw() {
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();
        assert_eq!(key.sign(b"payload").unwrap().len(), 64);
    }

    #[test]
    fn key_authorization_binds_token_to_thumbprint() {
        let key = AccountKey::generate(&KeySpec::p256()).unwrap();
        let key_auth = key.key_authorization("tok");
        assert_eq!(key_auth, format!("tok.{}", key.thumbprint()));
        assert_eq!(key.thumbprint().len(), 43);
    }
}
