use async_trait::async_trait;

use super::db::ApplicationRecord;

/// Issues certificates for applications whose requirements are all met.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Returns the URL of the issued certificate.
    async fn issue(&self, application: &ApplicationRecord) -> eyre::Result<String>;
}

/// Hands out a certificate URL without producing a certificate.
#[derive(Debug, Clone)]
pub struct StubAuthority {
    base_url: String,
}

impl StubAuthority {
    pub fn new(base_url: impl Into<String>) -> Self {
        StubAuthority {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CertificateAuthority for StubAuthority {
    async fn issue(&self, application: &ApplicationRecord) -> eyre::Result<String> {
        log::info!(
            "Issuing certificate for {} ({})",
            application.id,
            application.names.join(", ")
        );

        Ok(format!("{}cert/{}", self.base_url, application.id))
    }
}
