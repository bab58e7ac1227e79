use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// A challenge object.
///
/// Represents a server's offer to validate a client's possession of an identifier in a specific
/// way.
///
/// # Example JSON
///
/// ```json
/// {
///   "type": "tls-sni-01",
///   "status": "pending",
///   "url": "http://localhost:4000/authz/5a9c0b33-.../2",
///   "token": "WCdRWkCy4THTD_j5IH4ISA",
///   "n": 1
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Type of challenge encoded in the object.
    #[serde(rename = "type")]
    pub _type: String,

    /// URL to which a response can be posted.
    pub url: String,

    /// Status of this challenge.
    pub status: ChallengeStatus,

    pub token: String,

    /// Number of `tls-sni-01` iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    /// Time at which the server validated this challenge.
    ///
    /// Uses RFC 3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,

    /// Error that occurred while the server was validating the challenge, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<api::Problem>,
}

/// A client's answer to a challenge.
///
/// All fields are optional on the wire; responders and validators decide which ones they need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChallengeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub _type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_authorization: Option<String>,

    /// Number of `tls-sni-01` iterations, echoed from the challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
}

impl ChallengeResponse {
    pub fn new(challenge_type: &str, token: &str, key_authorization: String) -> Self {
        ChallengeResponse {
            resource: Some("challenge".to_owned()),
            _type: Some(challenge_type.to_owned()),
            token: Some(token.to_owned()),
            key_authorization: Some(key_authorization),
            n: None,
        }
    }

    /// Answers `challenge` with `key_authorization`, carrying over its type, token and `n`.
    pub fn for_challenge(challenge: &Challenge, key_authorization: String) -> Self {
        ChallengeResponse {
            n: challenge.n,
            ..ChallengeResponse::new(&challenge._type, &challenge.token, key_authorization)
        }
    }
}
