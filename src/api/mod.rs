//! JSON API payloads.
//!
//! Shared by the server routes and the client. Field names follow the wire format of the
//! draft-era endpoints (`new-reg`, `new-app`, `authz`).

use std::fmt;

use serde::{Deserialize, Serialize};

mod application;
mod authorization;
mod challenge;
mod directory;
mod identifier;
mod registration;

pub use self::{
    application::{Application, ApplicationStatus, NewApplication, Requirement},
    authorization::{Authorization, AuthorizationStatus, NewAuthorization},
    challenge::{Challenge, ChallengeResponse, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    identifier::Identifier,
    registration::{NewRegistration, Registration, RegistrationStatus, UpdateRegistration},
};

/// URN prefix of every ACME problem type.
pub const ERROR_NAMESPACE: &str = "urn:ietf:params:acme:error:";

/// Problem kinds produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    Malformed,
    Unauthorized,
    BadNonce,
    ServerInternal,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::Malformed => "malformed",
            ProblemKind::Unauthorized => "unauthorized",
            ProblemKind::BadNonce => "badNonce",
            ProblemKind::ServerInternal => "serverInternal",
        }
    }
}

/// An error document.
///
/// # Example JSON
///
/// ```json
/// {
///   "type": "urn:ietf:params:acme:error:badNonce",
///   "title": "Bad nonce",
///   "description": "The provided nonce was not accepted"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Problem {
    pub fn new(kind: ProblemKind, title: &str, description: Option<String>) -> Self {
        Problem {
            _type: format!("{ERROR_NAMESPACE}{}", kind.as_str()),
            title: Some(title.to_owned()),
            description,
        }
    }

    /// Returns the problem type without its URN namespace.
    pub fn kind(&self) -> &str {
        self._type
            .strip_prefix(ERROR_NAMESPACE)
            .unwrap_or(&self._type)
    }

    /// Returns true if problem type is "badNonce".
    pub fn is_bad_nonce(&self) -> bool {
        self.kind() == ProblemKind::BadNonce.as_str()
    }

    pub fn is_kind(&self, kind: ProblemKind) -> bool {
        self.kind() == kind.as_str()
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self._type)?;

        if let Some(title) = &self.title {
            write!(f, ": {title}")?;
        }

        if let Some(description) = &self.description {
            write!(f, " ({description})")?;
        }

        Ok(())
    }
}
