use der::{
    asn1::{Ia5String, ObjectIdentifier},
    Any, Decode as _, Encode as _, Tag, Tagged as _,
};
use eyre::{eyre, WrapErr as _};
use p256::{ecdsa::signature::Verifier as _, pkcs8::DecodePublicKey as _};
use rsa::RsaPublicKey;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::{CertReq, ExtensionReq},
};

use crate::{
    error::CryptoError,
    key::AccountKey,
    util::{base64url_decode, is_dns_name},
};

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const OID_ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Creates a CSR with `domains` and signs it with `signer`.
///
/// The first item of `domains` is picked for the CSR's Common Name (CN). All domains are added to a
/// Subject Alternative Name (SAN) extension.
pub fn create_csr(signer: &p256::ecdsa::SigningKey, domains: &[&str]) -> eyre::Result<CertReq> {
    let primary_domain = domains
        .first()
        .ok_or_else(|| eyre!("at least one domain is required"))?;
    let subject = format!("CN={primary_domain}")
        .parse::<Name>()
        .context("invalid subject")?;

    let mut csr = CsrBuilder::new(subject, signer).context("csr builder")?;

    let alt_names = domains
        .iter()
        .map(|domain| Ok(GeneralName::DnsName(Ia5String::new(domain)?)))
        .collect::<der::Result<Vec<_>>>()?;
    csr.add_extension(&SubjectAltName(alt_names))
        .context("add SAN")?;

    csr.build::<p256::ecdsa::DerSignature>()
        .context("build csr")
}

/// [`create_csr`], DER encoded.
pub fn create_csr_der(signer: &p256::ecdsa::SigningKey, domains: &[&str]) -> eyre::Result<Vec<u8>> {
    Ok(create_csr(signer, domains)?.to_der()?)
}

/// Which CSRs the server accepts beyond the fixed rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrPolicy {
    /// Dotted OIDs of extensions tolerated next to `subjectAltName`.
    pub allowed_extensions: Vec<String>,
}

impl CsrPolicy {
    fn allows(&self, oid: &ObjectIdentifier) -> bool {
        let oid = oid.to_string();
        self.allowed_extensions.iter().any(|allowed| *allowed == oid)
    }
}

/// First rule a CSR broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CsrError {
    #[error("CSR is not valid base64url")]
    Encoding,

    #[error("Unable to parse CSR: {0}")]
    Parse(String),

    #[error("Unsupported CSR signature algorithm {0}")]
    SignatureAlgorithm(String),

    #[error("CSR signature does not verify")]
    Signature,

    #[error("Subject contains an attribute other than commonName: {0}")]
    SubjectAttribute(String),

    #[error("Subject contains more than one commonName")]
    MultipleCommonNames,

    #[error("CSR contains an attribute other than extensionRequest: {0}")]
    Attribute(String),

    #[error("CSR contains more than one extensionRequest")]
    MultipleExtensionRequests,

    #[error("CSR requests an extension other than subjectAltName: {0}")]
    Extension(String),

    #[error("CSR contains more than one subjectAltName extension")]
    MultipleSubjectAltNames,

    #[error("subjectAltName contains a non-dNSName entry")]
    NonDnsAltName,

    #[error("Invalid DNS name: {0}")]
    InvalidName(String),

    #[error("No names in CSR")]
    NoNames,
}

impl From<der::Error> for CsrError {
    fn from(err: der::Error) -> Self {
        CsrError::Parse(err.to_string())
    }
}

/// Checks a base64url DER CSR and returns the names it asks for.
///
/// Names are lowercased and deduplicated, commonName first. Anything outside the accepted shape
/// rejects the whole request.
pub fn check_csr(csr: &str, policy: &CsrPolicy) -> Result<Vec<String>, CsrError> {
    let der = base64url_decode(csr).map_err(|_| CsrError::Encoding)?;
    let req = CertReq::from_der(&der)?;

    verify_csr_signature(&req)?;

    let mut names = Vec::new();

    let mut common_names = 0;
    for rdn in req.info.subject.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid != OID_COMMON_NAME {
                return Err(CsrError::SubjectAttribute(atv.oid.to_string()));
            }

            common_names += 1;
            if common_names > 1 {
                return Err(CsrError::MultipleCommonNames);
            }

            names.push(directory_string(&atv.value)?);
        }
    }

    let mut extension_requests = 0;
    for attr in req.info.attributes.iter() {
        if attr.oid != OID_EXTENSION_REQUEST {
            return Err(CsrError::Attribute(attr.oid.to_string()));
        }

        extension_requests += attr.values.len();
        if extension_requests > 1 {
            return Err(CsrError::MultipleExtensionRequests);
        }

        for value in attr.values.iter() {
            let ext_req = ExtensionReq::from_der(&value.to_der()?)?;
            alt_names(&ext_req, policy, &mut names)?;
        }
    }

    let mut checked = Vec::with_capacity(names.len());
    for name in names {
        let name = name.to_ascii_lowercase();

        if !is_dns_name(&name) {
            return Err(CsrError::InvalidName(name));
        }

        if !checked.contains(&name) {
            checked.push(name);
        }
    }

    if checked.is_empty() {
        return Err(CsrError::NoNames);
    }

    Ok(checked)
}

fn alt_names(
    ext_req: &ExtensionReq,
    policy: &CsrPolicy,
    names: &mut Vec<String>,
) -> Result<(), CsrError> {
    let mut seen_san = false;

    for ext in &ext_req.0 {
        if ext.extn_id != OID_SUBJECT_ALT_NAME {
            if policy.allows(&ext.extn_id) {
                continue;
            }

            return Err(CsrError::Extension(ext.extn_id.to_string()));
        }

        if seen_san {
            return Err(CsrError::MultipleSubjectAltNames);
        }
        seen_san = true;

        let san = SubjectAltName::from_der(ext.extn_value.as_bytes())?;
        for name in san.0 {
            match name {
                GeneralName::DnsName(name) => names.push(name.to_string()),
                _ => return Err(CsrError::NonDnsAltName),
            }
        }
    }

    Ok(())
}

fn directory_string(value: &Any) -> Result<String, CsrError> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String => {
            std::str::from_utf8(value.value())
                .map(str::to_owned)
                .map_err(|err| CsrError::Parse(err.to_string()))
        }
        tag => Err(CsrError::Parse(format!("unsupported commonName encoding {tag}"))),
    }
}

fn verify_csr_signature(req: &CertReq) -> Result<(), CsrError> {
    let info = req.info.to_der()?;
    let spki = req.info.public_key.to_der()?;
    let signature = req.signature.as_bytes().ok_or(CsrError::Signature)?;

    let oid = req.algorithm.oid;

    if oid == OID_ECDSA_WITH_SHA256 {
        let key = p256::ecdsa::VerifyingKey::from_public_key_der(&spki)
            .map_err(|_| CsrError::Signature)?;
        let sig = p256::ecdsa::Signature::from_der(signature).map_err(|_| CsrError::Signature)?;

        key.verify(&info, &sig).map_err(|_| CsrError::Signature)
    } else if oid == OID_SHA256_WITH_RSA {
        let key = RsaPublicKey::from_public_key_der(&spki).map_err(|_| CsrError::Signature)?;
        let sig =
            rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| CsrError::Signature)?;

        rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key)
            .verify(&info, &sig)
            .map_err(|_| CsrError::Signature)
    } else {
        Err(CsrError::SignatureAlgorithm(oid.to_string()))
    }
}

/// A throwaway certificate and its encodings.
#[derive(Debug, Clone)]
pub struct SelfSigned {
    pub pem: String,
    pub der: Vec<u8>,
}

/// Builds a self-signed leaf for `name`, valid from a day ago until a day from now.
///
/// `name` is both the commonName and the only dNSName.
pub fn self_signed(name: &str, key: &AccountKey) -> Result<SelfSigned, CryptoError> {
    let key_pair = rcgen::KeyPair::from_pem(&key.to_pem()?)
        .map_err(|err| CryptoError::Parse(err.to_string()))?;

    let mut params = rcgen::CertificateParams::new(vec![name.to_owned()])
        .map_err(|err| CryptoError::Encoding(err.to_string()))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, name);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(1);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| CryptoError::Encoding(err.to_string()))?;

    Ok(SelfSigned {
        pem: cert.pem(),
        der: cert.der().to_vec(),
    })
}
