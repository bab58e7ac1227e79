use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    api::{self, ApplicationStatus},
    error::ClientError,
    key::AccountKey,
    req::req_expect_header,
    trans::Transport,
    util::{base64url, is_dns_name, read_json},
};

/// A server response together with the headers the protocol cares about.
#[derive(Debug, Clone)]
pub struct Resource<T> {
    pub body: T,

    /// The `Location` header, if any.
    pub location: Option<String>,

    /// `Link` header targets by relation.
    pub links: HashMap<String, String>,
}

impl<T: DeserializeOwned> Resource<T> {
    async fn from_response(res: reqwest::Response) -> eyre::Result<Self> {
        let location = req_expect_header(&res, "location").ok();
        let links = parse_links(res.headers());

        Ok(Resource {
            body: read_json(res).await?,
            location,
            links,
        })
    }
}

impl<T> Resource<T> {
    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links.get(rel).map(String::as_str)
    }

    /// The `Location` header, which creation endpoints always send.
    pub fn require_location(&self) -> eyre::Result<&str> {
        self.location
            .as_deref()
            .ok_or_else(|| eyre::eyre!("response has no Location header"))
    }
}

/// Collects `<url>; rel="name"` entries from every `Link` header. Later entries win.
pub(crate) fn parse_links(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut links = HashMap::new();

    let values = headers
        .get_all(reqwest::header::LINK)
        .iter()
        .filter_map(|value| value.to_str().ok());

    for entry in values.flat_map(|value| value.split(',')) {
        let mut parts = entry.split(';');

        let Some(target) = parts
            .next()
            .map(str::trim)
            .and_then(|target| target.strip_prefix('<'))
            .and_then(|target| target.strip_suffix('>'))
        else {
            continue;
        };

        for param in parts {
            if let Some(rel) = param.trim().strip_prefix("rel=") {
                links.insert(rel.trim_matches('"').to_owned(), target.to_owned());
            }
        }
    }

    links
}

/// Speaks the protocol to one ACME server on behalf of one account key.
#[derive(Debug)]
pub struct AcmeClient {
    transport: Transport,
    directory_url: String,
    directory: Mutex<Option<api::Directory>>,
}

impl AcmeClient {
    pub fn new(key: AccountKey, directory_url: impl Into<String>) -> Self {
        AcmeClient {
            transport: Transport::new(key),
            directory_url: directory_url.into(),
            directory: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &AccountKey {
        self.transport.key()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Fetches the directory on first use.
    pub async fn directory(&self) -> eyre::Result<api::Directory> {
        if let Some(directory) = self.directory.lock().clone() {
            return Ok(directory);
        }

        let directory = self
            .transport
            .get_json::<api::Directory>(&self.directory_url)
            .await?;
        log::debug!("Loaded directory {}", self.directory_url);

        *self.directory.lock() = Some(directory.clone());
        Ok(directory)
    }

    /// Registers the account key.
    ///
    /// At least one contact URI is required. Pass the server's terms-of-service URL as
    /// `agreement` to accept them.
    pub async fn new_registration(
        &self,
        contact: Vec<String>,
        agreement: Option<String>,
    ) -> eyre::Result<Resource<api::Registration>> {
        if contact.is_empty() {
            return Err(ClientError::InvalidArgument(
                "at least one contact is required".to_owned(),
            )
            .into());
        }

        let directory = self.directory().await?;

        let payload = api::NewRegistration {
            resource: Some("new-reg".to_owned()),
            contact: Some(contact),
            agreement,
        };

        let res = self.transport.post(&directory.new_reg, &payload).await?;
        Resource::from_response(res).await
    }

    /// Updates the registration at `url` (the `Location` returned on registration).
    pub async fn update_registration(
        &self,
        url: &str,
        mut update: api::UpdateRegistration,
    ) -> eyre::Result<Resource<api::Registration>> {
        update.resource.get_or_insert_with(|| "reg".to_owned());

        let res = self.transport.post(url, &update).await?;
        Resource::from_response(res).await
    }

    /// Asks for an authorization of `domain`. Needs a server offering `new-authz`.
    pub async fn new_authorization(
        &self,
        domain: &str,
    ) -> eyre::Result<Resource<api::Authorization>> {
        let domain = domain.to_ascii_lowercase();

        if !is_dns_name(&domain) {
            return Err(ClientError::InvalidArgument(format!("{domain} is not a domain name")).into());
        }

        let directory = self.directory().await?;
        let url = directory
            .new_authz
            .ok_or(ClientError::MissingEndpoint("new-authz"))?;

        let payload = api::NewAuthorization {
            resource: Some("new-authz".to_owned()),
            identifier: api::Identifier::dns(&domain),
        };

        let res = self.transport.post(&url, &payload).await?;
        Resource::from_response(res).await
    }

    /// Applies for a certificate for the names in `csr_der`.
    pub async fn new_application(
        &self,
        csr_der: &[u8],
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
    ) -> eyre::Result<Resource<api::Application>> {
        let directory = self.directory().await?;

        let payload = api::NewApplication {
            resource: Some("new-app".to_owned()),
            csr: Some(base64url(csr_der)),
            not_before: not_before.map(|at| at.format(&Rfc3339)).transpose()?,
            not_after: not_after.map(|at| at.format(&Rfc3339)).transpose()?,
        };

        let res = self.transport.post(&directory.new_app, &payload).await?;
        Resource::from_response(res).await
    }

    pub async fn authorization(&self, url: &str) -> eyre::Result<api::Authorization> {
        self.transport.get_json(url).await
    }

    pub async fn application(&self, url: &str) -> eyre::Result<api::Application> {
        self.transport.get_json(url).await
    }

    /// Answers `challenge` with this account's key authorization.
    ///
    /// Provision the matching validator before calling this.
    pub async fn respond_to_challenge(
        &self,
        challenge: &api::Challenge,
    ) -> eyre::Result<api::Challenge> {
        let response = api::ChallengeResponse::for_challenge(
            challenge,
            self.key().key_authorization(&challenge.token),
        );

        let res = self.transport.post(&challenge.url, &response).await?;
        read_json(res).await
    }

    /// Requests a certificate directly. Needs a server offering `new-cert`.
    ///
    /// Returns the certificate bytes as served.
    pub async fn new_certificate(&self, csr_der: &[u8]) -> eyre::Result<Vec<u8>> {
        let directory = self.directory().await?;
        let url = directory
            .new_cert
            .ok_or(ClientError::MissingEndpoint("new-cert"))?;

        let payload = serde_json::json!({
            "resource": "new-cert",
            "csr": base64url(csr_der),
        });

        let res = self.transport.post(&url, &payload).await?;
        Ok(res.bytes().await?.to_vec())
    }

    /// Waits until the application at `url` is valid or invalid.
    pub async fn poll_application(
        &self,
        url: &str,
        limit: usize,
        delay: Duration,
    ) -> eyre::Result<api::Application> {
        self.transport
            .poll::<api::Application, _>(
                url,
                |app| matches!(app.status, ApplicationStatus::Valid | ApplicationStatus::Invalid),
                limit,
                delay,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue, LINK};

    use super::*;
    use crate::key::KeySpec;

    #[test]
    fn links_by_relation() {
        let mut headers = HeaderMap::new();
        headers.append(
            LINK,
            HeaderValue::from_static(
                r#"<https://example.com/terms>;rel="terms-of-service", <https://example.com/next>; rel=next"#,
            ),
        );
        headers.append(LINK, HeaderValue::from_static(r#"<https://example.com/terms-v2>;rel="terms-of-service""#));
        headers.append(LINK, HeaderValue::from_static("garbage"));

        let links = parse_links(&headers);
        assert_eq!(links.len(), 2);
        assert_eq!(links["terms-of-service"], "https://example.com/terms-v2");
        assert_eq!(links["next"], "https://example.com/next");
    }

    #[tokio::test]
    async fn arguments_are_checked_before_any_request() {
        // nothing listens here
        let client = AcmeClient::new(
            AccountKey::generate(&KeySpec::p256()).unwrap(),
            "http://127.0.0.1:9/directory",
        );

        let err = client.new_registration(Vec::new(), None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::InvalidArgument(_))
        ));

        let err = client.new_authorization("not a domain").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::InvalidArgument(_))
        ));
    }
}
