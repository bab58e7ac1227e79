use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Authorization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
}

/// An authorization object.
///
/// Represents a server's authorization for an account to represent an identifier.
///
/// # Example JSON
///
/// ```json
/// {
///   "identifier": { "type": "dns", "value": "example.com" },
///   "status": "pending",
///   "expires": "2017-01-09T08:26:43Z",
///   "challenges": [
///     {
///       "type": "http-01",
///       "status": "pending",
///       "url": "http://localhost:4000/authz/9d4e.../0",
///       "token": "MUi-gqeOJdRkSb_YR2eaMx"
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization identifier.
    pub identifier: api::Identifier,

    /// Authorization status.
    pub status: AuthorizationStatus,

    /// The timestamp after which the server will consider this authorization invalid.
    ///
    /// Uses RFC 3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// URL of the application this authorization is restricted to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// The challenges the client can fulfill. Any one of them is sufficient.
    pub challenges: Vec<api::Challenge>,

    /// Sets of challenge indices that together satisfy the authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combinations: Option<Vec<Vec<usize>>>,
}

impl Authorization {
    /// Returns the first challenge of the given type.
    pub fn challenge(&self, challenge_type: &str) -> Option<&api::Challenge> {
        self.challenges.iter().find(|c| c._type == challenge_type)
    }

    /// Returns an `http-01` challenge, if one is present.
    pub fn http_challenge(&self) -> Option<&api::Challenge> {
        self.challenge("http-01")
    }

    /// Returns a `dns-01` challenge, if one is present.
    pub fn dns_challenge(&self) -> Option<&api::Challenge> {
        self.challenge("dns-01")
    }

    /// Returns a `tls-sni-01` challenge, if one is present.
    pub fn tls_sni_challenge(&self) -> Option<&api::Challenge> {
        self.challenge("tls-sni-01")
    }
}

/// Payload of a `new-authz` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAuthorization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    pub identifier: api::Identifier,
}
