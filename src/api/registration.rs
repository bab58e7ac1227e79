use serde::{Deserialize, Serialize};

use crate::jws::Jwk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Good,
    Deactivated,
}

/// An account registration.
///
/// Identified by the thumbprint of its key.
///
/// # Example JSON
///
/// ```json
/// {
///   "key": {
///     "kty": "EC",
///     "crv": "P-256",
///     "x": "ttpobTRK2bw7ttGBESRO7Nb23mbIRfnRZwunL1W6wRI",
///     "y": "h2Z00J37_2qRKH0-flrHEsH0xbit915Tyvd2v_CAOSk"
///   },
///   "status": "good",
///   "contact": ["mailto:foo@bar.com"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub key: Jwk,

    pub status: RegistrationStatus,

    #[serde(default)]
    pub contact: Vec<String>,

    /// URL of the terms of service the holder agreed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

/// Payload of a `new-reg` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

/// Payload of a `reg/{id}` update.
///
/// Absent fields leave the registration untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}
