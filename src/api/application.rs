use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Application`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    /// Waiting on its requirements.
    Pending,

    /// All requirements are met; the certificate is being issued.
    Processing,

    /// The certificate has been issued.
    Valid,

    /// A requirement failed.
    Invalid,
}

/// An application for a certificate.
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "pending",
///   "csr": "MIIBPTCBxAIBADBFMQ...",
///   "notBefore": "2016-01-01T00:00:00Z",
///   "notAfter": "2016-01-08T00:00:00Z",
///   "requirements": [
///     {
///       "type": "authorization",
///       "status": "pending",
///       "url": "http://localhost:4000/authz/1234"
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub status: ApplicationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// The CSR in base64url-encoded DER.
    pub csr: String,

    /// Uses RFC 3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,

    /// Uses RFC 3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,

    pub requirements: Vec<Requirement>,

    /// URL of the issued certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

/// A reference from an application to one of the authorizations it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Always `authorization`.
    #[serde(rename = "type")]
    pub _type: String,

    pub status: api::AuthorizationStatus,

    pub url: String,
}

impl Requirement {
    pub fn authorization(url: String, status: api::AuthorizationStatus) -> Self {
        Requirement {
            _type: "authorization".to_owned(),
            status,
            url,
        }
    }
}

/// Payload of a `new-app` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewApplication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// The CSR in base64url-encoded DER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
}
