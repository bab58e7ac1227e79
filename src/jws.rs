//! Flattened JSON JWS with an embedded `jwk`, as carried by every signed ACME request.
//!
//! See [RFC 7515 §7.2.2](https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2).

use p256::ecdsa::signature::Verifier as _;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::{
    error::CryptoError,
    key::AccountKey,
    util::{base64url, base64url_decode},
};

/// JSON Web Key, public part only.
///
/// Members other than the key material (`alg`, `use`, `kid`) are ignored when reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },

    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
}

impl Jwk {
    /// RFC 7638 thumbprint: base64url SHA-256 of the required members in lexical order.
    pub fn thumbprint(&self) -> String {
        // LEXICAL ORDER OF FIELDS MATTER!
        let canonical = match self {
            Jwk::Ec { crv, x, y } => serde_json::json!({
                "crv": crv,
                "kty": "EC",
                "x": x,
                "y": y,
            }),
            Jwk::Rsa { n, e } => serde_json::json!({
                "e": e,
                "kty": "RSA",
                "n": n,
            }),
        };

        base64url(&Sha256::digest(canonical.to_string()))
    }

    fn public_key(&self) -> Result<PublicKey, CryptoError> {
        match self {
            Jwk::Ec { crv, x, y } => {
                if crv != "P-256" {
                    return Err(CryptoError::InvalidSignature(format!(
                        "unsupported curve: {crv}"
                    )));
                }

                let mut sec1 = vec![0x04];
                sec1.extend(base64url_decode(x)?);
                sec1.extend(base64url_decode(y)?);

                p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                    .map(PublicKey::Ec)
                    .map_err(|err| CryptoError::InvalidSignature(format!("bad EC key: {err}")))
            }

            Jwk::Rsa { n, e } => {
                let n = BigUint::from_bytes_be(&base64url_decode(n)?);
                let e = BigUint::from_bytes_be(&base64url_decode(e)?);

                RsaPublicKey::new(n, e)
                    .map(PublicKey::Rsa)
                    .map_err(|err| CryptoError::InvalidSignature(format!("bad RSA key: {err}")))
            }
        }
    }
}

enum PublicKey {
    Ec(p256::ecdsa::VerifyingKey),
    Rsa(RsaPublicKey),
}

impl PublicKey {
    fn verify(&self, alg: &str, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        fn rsa_verify<D>(key: &RsaPublicKey, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError>
        where
            D: sha2::Digest + sha2::digest::const_oid::AssociatedOid,
        {
            let sig = rsa::pkcs1v15::Signature::try_from(sig)
                .map_err(|err| CryptoError::InvalidSignature(err.to_string()))?;

            rsa::pkcs1v15::VerifyingKey::<D>::new(key.clone())
                .verify(msg, &sig)
                .map_err(|err| CryptoError::InvalidSignature(err.to_string()))
        }

        match (self, alg) {
            (PublicKey::Ec(key), "ES256") => {
                let sig = p256::ecdsa::Signature::from_slice(sig)
                    .map_err(|err| CryptoError::InvalidSignature(err.to_string()))?;

                key.verify(msg, &sig)
                    .map_err(|err| CryptoError::InvalidSignature(err.to_string()))
            }

            (PublicKey::Rsa(key), "RS256") => rsa_verify::<Sha256>(key, msg, sig),
            (PublicKey::Rsa(key), "RS384") => rsa_verify::<Sha384>(key, msg, sig),
            (PublicKey::Rsa(key), "RS512") => rsa_verify::<Sha512>(key, msg, sig),

            (_, alg) => Err(CryptoError::InvalidSignature(format!(
                "algorithm {alg} does not match key"
            ))),
        }
    }
}

/// Protected header of an ACME request.
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field.
///
/// This protocol generation embeds the `jwk` in every request; the server identifies the caller
/// by its thumbprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    /// Algorithm. Never "none" or a MAC.
    pub alg: String,

    /// Public key matching the signing key.
    pub jwk: Jwk,

    /// Anti-replay token issued by the server.
    pub nonce: String,

    /// Target URL of the request.
    pub url: String,
}

#[derive(Deserialize)]
struct RawHeader {
    alg: Option<String>,
    jwk: Option<serde_json::Value>,
    nonce: Option<String>,
    url: Option<String>,
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenedJsonJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// A successfully verified request.
#[derive(Debug, Clone)]
pub struct Verified {
    pub header: ProtectedHeader,

    /// Decoded payload. An empty payload segment reads as `null`.
    pub payload: serde_json::Value,
}

impl Verified {
    pub fn jwk(&self) -> &Jwk {
        &self.header.jwk
    }

    pub fn thumbprint(&self) -> String {
        self.header.jwk.thumbprint()
    }
}

/// Signs `payload` for delivery to `url`.
pub fn sign<T: Serialize + ?Sized>(
    key: &AccountKey,
    nonce: &str,
    url: &str,
    payload: &T,
) -> Result<FlattenedJsonJws, CryptoError> {
    if nonce.is_empty() {
        return Err(CryptoError::MissingHeaderField("nonce"));
    }

    if url.is_empty() {
        return Err(CryptoError::MissingHeaderField("url"));
    }

    let header = ProtectedHeader {
        alg: key.alg().to_owned(),
        jwk: key.jwk(),
        nonce: nonce.to_owned(),
        url: url.to_owned(),
    };

    let protected = base64url(&serde_json::to_vec(&header)?);
    let payload = base64url(&serde_json::to_vec(payload)?);

    let to_sign = format!("{protected}.{payload}");
    let signature = base64url(&key.sign(to_sign.as_bytes())?);

    Ok(FlattenedJsonJws {
        protected,
        payload,
        signature,
    })
}

/// Checks the envelope's signature against the `jwk` it carries.
pub fn verify(jws: &FlattenedJsonJws) -> Result<Verified, CryptoError> {
    let raw = base64url_decode(&jws.protected)?;
    let raw = serde_json::from_slice::<RawHeader>(&raw)?;

    let alg = raw
        .alg
        .filter(|alg| !alg.is_empty())
        .ok_or(CryptoError::MissingHeaderField("alg"))?;
    let jwk = raw.jwk.ok_or(CryptoError::MissingHeaderField("jwk"))?;
    let nonce = raw
        .nonce
        .filter(|nonce| !nonce.is_empty())
        .ok_or(CryptoError::MissingHeaderField("nonce"))?;
    let url = raw
        .url
        .filter(|url| !url.is_empty())
        .ok_or(CryptoError::MissingHeaderField("url"))?;

    let jwk = serde_json::from_value::<Jwk>(jwk)
        .map_err(|err| CryptoError::InvalidSignature(format!("unsupported key: {err}")))?;

    let signature = base64url_decode(&jws.signature)?;
    let signed = format!("{}.{}", jws.protected, jws.payload);
    jwk.public_key()?
        .verify(&alg, signed.as_bytes(), &signature)?;

    let payload = if jws.payload.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&base64url_decode(&jws.payload)?)?
    };

    Ok(Verified {
        header: ProtectedHeader {
            alg,
            jwk,
            nonce,
            url,
        },
        payload,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::key::KeySpec;

    fn ec_key() -> AccountKey {
        AccountKey::generate(&KeySpec::p256()).unwrap()
    }

    #[test]
    fn rfc7638_thumbprint() {
        let jwk = serde_json::from_value::<Jwk>(json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
            "alg": "RS256",
            "kid": "2011-04-29"
        }))
        .unwrap();

        assert_eq!(jwk.thumbprint(), "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs");
    }

    #[test]
    fn sign_then_verify_ec() {
        let key = ec_key();
        let jws = sign(&key, "36594", "http://127.0.0.1/new-reg", &json!({"contact": []})).unwrap();

        let verified = verify(&jws).unwrap();
        assert_eq!(verified.header.alg, "ES256");
        assert_eq!(verified.header.nonce, "36594");
        assert_eq!(verified.header.url, "http://127.0.0.1/new-reg");
        assert_eq!(verified.payload, json!({"contact": []}));
        assert_eq!(verified.thumbprint(), key.thumbprint());
    }

    #[test]
    fn sign_then_verify_rsa() {
        let key = AccountKey::generate(&KeySpec::Rsa { bits: 2048 }).unwrap();
        let jws = sign(&key, "1", "http://127.0.0.1/x", &json!(42)).unwrap();

        let verified = verify(&jws).unwrap();
        assert_eq!(verified.header.alg, "RS256");
        assert!(matches!(verified.jwk(), Jwk::Rsa { .. }));
        assert_eq!(verified.payload, json!(42));
    }

    #[test]
    fn sign_requires_nonce_and_url() {
        let key = ec_key();

        assert!(matches!(
            sign(&key, "", "http://127.0.0.1/", &json!({})),
            Err(CryptoError::MissingHeaderField("nonce"))
        ));
        assert!(matches!(
            sign(&key, "1", "", &json!({})),
            Err(CryptoError::MissingHeaderField("url"))
        ));
    }

    #[test]
    fn tampered_payload_fails() {
        let key = ec_key();
        let mut jws = sign(&key, "1", "http://127.0.0.1/", &json!({"a": 1})).unwrap();
        jws.payload = base64url(br#"{"a":2}"#);

        assert!(matches!(verify(&jws), Err(CryptoError::InvalidSignature(_))));
    }

    #[test]
    fn algorithm_must_fit_key() {
        let key = ec_key();
        let jws = sign(&key, "1", "http://127.0.0.1/", &json!({})).unwrap();

        let header = json!({
            "alg": "RS256",
            "jwk": key.jwk(),
            "nonce": "1",
            "url": "http://127.0.0.1/",
        });
        let forged = FlattenedJsonJws {
            protected: base64url(&serde_json::to_vec(&header).unwrap()),
            ..jws
        };

        assert!(matches!(verify(&forged), Err(CryptoError::InvalidSignature(_))));
    }

    #[test]
    fn missing_header_fields_are_reported() {
        let key = ec_key();
        let header = json!({ "alg": "ES256", "jwk": key.jwk(), "url": "http://127.0.0.1/" });
        let protected = base64url(&serde_json::to_vec(&header).unwrap());
        let payload = base64url(b"{}");
        let signature = base64url(&key.sign(format!("{protected}.{payload}").as_bytes()).unwrap());

        let jws = FlattenedJsonJws {
            protected,
            payload,
            signature,
        };

        assert!(matches!(
            verify(&jws),
            Err(CryptoError::MissingHeaderField("nonce"))
        ));
    }

    #[test]
    fn empty_payload_is_null() {
        let key = ec_key();
        let header = json!({
            "alg": "ES256",
            "jwk": key.jwk(),
            "nonce": "7",
            "url": "http://127.0.0.1/",
        });
        let protected = base64url(&serde_json::to_vec(&header).unwrap());
        let signature = base64url(&key.sign(format!("{protected}.").as_bytes()).unwrap());

        let verified = verify(&FlattenedJsonJws {
            protected,
            payload: String::new(),
            signature,
        })
        .unwrap();

        assert_eq!(verified.payload, serde_json::Value::Null);
    }

    #[test]
    fn unsupported_key_type_fails_verification() {
        let header = json!({
            "alg": "EdDSA",
            "jwk": { "kty": "OKP", "crv": "Ed25519", "x": "AAAA" },
            "nonce": "1",
            "url": "http://127.0.0.1/",
        });

        let jws = FlattenedJsonJws {
            protected: base64url(&serde_json::to_vec(&header).unwrap()),
            payload: base64url(b"{}"),
            signature: base64url(b"sig"),
        };

        assert!(matches!(verify(&jws), Err(CryptoError::InvalidSignature(_))));
    }
}
