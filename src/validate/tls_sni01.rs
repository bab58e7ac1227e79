use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use sha2::{Digest as _, Sha256};
use tokio::{io::AsyncWriteExt as _, net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_rustls::TlsAcceptor;

use super::{Answer, ValidatorError};
use crate::{
    api::ChallengeResponse,
    cert::self_signed,
    key::{AccountKey, KeySpec},
};

/// Name of the certificate served for unknown SNI values.
const DEFAULT_NAME: &str = "acme.invalid";

/// SNI names for `n` iterations over `key_authorization`.
///
/// `Z(0)` is the key authorization and `Z(i)` the hex SHA-256 of `Z(i-1)`; iteration `i` yields
/// `Z(i)[0..32].Z(i)[32..64].acme.invalid`.
pub fn sni_names(key_authorization: &str, n: u32) -> Vec<String> {
    let mut z = key_authorization.to_owned();

    (0..n)
        .map(|_| {
            z = hex::encode(Sha256::digest(z.as_bytes()));
            format!("{}.{}.{DEFAULT_NAME}", &z[..32], &z[32..])
        })
        .collect()
}

/// Presents a self-signed certificate for each challenge SNI name, then hangs up.
#[derive(Debug)]
pub struct TlsSni01Validator {
    domain: String,
    answer: Answer,
    n: u32,
    port: u16,
    running: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl TlsSni01Validator {
    /// Uses the response's `n`, or a single iteration when it carries none.
    pub fn new(
        domain: &str,
        response: &ChallengeResponse,
        port: u16,
    ) -> Result<Self, ValidatorError> {
        Ok(TlsSni01Validator {
            domain: domain.to_ascii_lowercase(),
            answer: Answer::from_response("tls-sni-01", response)?,
            n: response.n.unwrap_or(1),
            port,
            running: None,
        })
    }

    /// Overrides the iteration count.
    pub fn with_iterations(mut self, n: u32) -> Self {
        self.n = n;
        self
    }

    pub fn names(&self) -> Vec<String> {
        sni_names(&self.answer.key_authorization, self.n)
    }

    fn acceptor(&self) -> Result<TlsAcceptor, ValidatorError> {
        let key = AccountKey::generate(&KeySpec::p256())
            .map_err(|err| ValidatorError::Tls(err.to_string()))?;

        let default = certified_key(DEFAULT_NAME, &key)?;
        let by_name = self
            .names()
            .into_iter()
            .map(|name| Ok((name.clone(), certified_key(&name, &key)?)))
            .collect::<Result<HashMap<_, _>, ValidatorError>>()?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|err| ValidatorError::Tls(err.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver { default, by_name }));

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Binds the port and starts answering handshakes.
    ///
    /// Certificate generation failures are reported as [`io::ErrorKind::Other`].
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        let acceptor = self.acceptor().map_err(io::Error::other)?;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let addr = listener.local_addr()?;

        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,

                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                log::warn!("tls-sni-01 accept failed: {err}");
                                continue;
                            }
                        };

                        let acceptor = acceptor.clone();

                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(mut tls) => {
                                    let _ = tls.shutdown().await;
                                }
                                Err(err) => log::debug!("tls-sni-01 handshake with {peer} failed: {err}"),
                            }
                        });
                    }
                }
            }
        });

        self.running = Some((stop_tx, task));

        log::debug!("tls-sni-01 validator for {} listening on {addr}", self.domain);
        Ok(addr)
    }

    pub async fn stop(&mut self) {
        if let Some((stop_tx, task)) = self.running.take() {
            let _ = stop_tx.send(());
            let _ = task.await;
        }
    }
}

fn certified_key(name: &str, key: &AccountKey) -> Result<Arc<CertifiedKey>, ValidatorError> {
    let cert = self_signed(name, key).map_err(|err| ValidatorError::Tls(err.to_string()))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|err| ValidatorError::Tls(err.to_string()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
        PrivatePkcs8KeyDer::from(der.to_vec()),
    ))
    .map_err(|err| ValidatorError::Tls(err.to_string()))?;

    Ok(Arc::new(CertifiedKey::new(
        vec![CertificateDer::from(cert.der)],
        signing_key,
    )))
}

#[derive(Debug)]
struct SniResolver {
    default: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let cert = client_hello
            .server_name()
            .and_then(|name| self.by_name.get(&name.to_ascii_lowercase()))
            .unwrap_or(&self.default);

        Some(Arc::clone(cert))
    }
}

#[cfg(test)]
mod tests {
    use der::Decode as _;
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{ServerName, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    };
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use x509_cert::{
        ext::pkix::{name::GeneralName, SubjectAltName},
        Certificate,
    };

    use super::*;

    #[derive(Debug)]
    struct AcceptAny;

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// dNSNames of the certificate presented for `sni`.
    async fn presented_names(addr: SocketAddr, sni: &str) -> Vec<String> {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny))
        .with_no_client_auth();

        let tcp = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        let tls = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from(sni.to_owned()).unwrap(), tcp)
            .await
            .unwrap();

        let certs = tls.get_ref().1.peer_certificates().unwrap();
        let cert = Certificate::from_der(&certs[0]).unwrap();

        let san = cert
            .tbs_certificate
            .extensions
            .unwrap()
            .into_iter()
            .find(|ext| ext.extn_id.to_string() == "2.5.29.17")
            .unwrap();

        SubjectAltName::from_der(san.extn_value.as_bytes())
            .unwrap()
            .0
            .into_iter()
            .filter_map(|name| match name {
                GeneralName::DnsName(name) => Some(name.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn names_iterate_sha256() {
        let names = sni_names("tok.thumb", 2);
        assert_eq!(names.len(), 2);

        let z1 = hex::encode(Sha256::digest(b"tok.thumb"));
        assert_eq!(names[0], format!("{}.{}.acme.invalid", &z1[..32], &z1[32..]));

        let z2 = hex::encode(Sha256::digest(z1.as_bytes()));
        assert_eq!(names[1], format!("{}.{}.acme.invalid", &z2[..32], &z2[32..]));
    }

    #[tokio::test]
    async fn sni_selects_certificate() {
        let response = ChallengeResponse::new("tls-sni-01", "tok", "tok.thumb".to_owned());
        let mut validator = TlsSni01Validator::new("example.com", &response, 0)
            .unwrap()
            .with_iterations(2);
        let addr = validator.start().await.unwrap();

        for name in validator.names() {
            assert_eq!(presented_names(addr, &name).await, [name.clone()]);
        }

        assert_eq!(
            presented_names(addr, "unrelated.example.com").await,
            [DEFAULT_NAME]
        );

        validator.stop().await;
    }

    #[test]
    fn iterations_follow_the_response() {
        let mut response = ChallengeResponse::new("tls-sni-01", "tok", "tok.thumb".to_owned());
        let validator = TlsSni01Validator::new("example.com", &response, 0).unwrap();
        assert_eq!(validator.names().len(), 1);

        response.n = Some(3);
        let validator = TlsSni01Validator::new("example.com", &response, 0).unwrap();
        assert_eq!(validator.names(), sni_names("tok.thumb", 3));
    }

    #[test]
    fn wrong_challenge_type_is_rejected() {
        let response = ChallengeResponse::new("http-01", "tok", "tok.thumb".to_owned());
        assert!(matches!(
            TlsSni01Validator::new("example.com", &response, 0),
            Err(ValidatorError::MalformedChallenge(_))
        ));
    }
}
