use std::{net::SocketAddr, path::Path};

use serde::Deserialize;

use super::ChallengeType;

/// Server settings.
///
/// Read from `config.toml` (optional) and `ACME_SERVER_*` environment variables; nested keys use
/// a double underscore, e.g. `ACME_SERVER_POLICY__MAX_VALIDITY_SECONDS`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name used to build resource URLs.
    pub host: String,

    /// Port used to build resource URLs. 80 and 443 are left out of the URLs.
    pub port: u16,

    /// Path prefix for every route, without trailing slash.
    pub base_path: String,

    /// Socket to bind. Defaults to all interfaces on [`port`](Self::port).
    pub listen: Option<SocketAddr>,

    /// Terms-of-service URL registrations must agree to, if any.
    pub terms_of_service: Option<String>,

    /// Challenges offered for each new authorization, in order.
    pub challenge_types: Vec<ChallengeType>,

    pub policy: Policy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "localhost".to_owned(),
            port: 80,
            base_path: String::new(),
            listen: None,
            terms_of_service: None,
            challenge_types: vec![
                ChallengeType::Http01,
                ChallengeType::Dns01,
                ChallengeType::TlsSni01,
            ],
            policy: Policy::default(),
        }
    }
}

/// Issuance limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Lifetime of new authorizations.
    pub authz_expiry_seconds: i64,

    /// Longest allowed `notAfter - notBefore` span.
    pub max_validity_seconds: i64,

    /// CSR extension OIDs accepted besides subjectAltName.
    pub allowed_extensions: Vec<String>,

    /// Restrict authorizations created for an application to that application.
    pub scoped_authorizations: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            authz_expiry_seconds: 7 * 24 * 60 * 60,
            max_validity_seconds: 90 * 24 * 60 * 60,
            allowed_extensions: Vec::new(),
            scoped_authorizations: false,
        }
    }
}

impl ServerConfig {
    /// Reads the file at `path` (if it exists), then overrides from the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        let env = config::Environment::with_prefix("ACME_SERVER")
            .prefix_separator("_")
            .separator("__")
            .keep_prefix(false)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("challenge_types")
            .with_list_parse_key("policy.allowed_extensions");

        let file = config::File::from(path.as_ref())
            .format(config::FileFormat::Toml)
            .required(false);

        config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    /// Prefix of every resource URL, with trailing slash.
    pub fn base_url(&self) -> String {
        let path = self.base_path.trim_end_matches('/');

        match self.port {
            80 => format!("http://{}{path}/", self.host),
            443 => format!("https://{}{path}/", self.host),
            port => format!("http://{}:{port}{path}/", self.host),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }
}
