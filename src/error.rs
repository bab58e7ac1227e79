use crate::api::Problem;

/// Failures of the key, signing and verification layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Unsupported key type, size or curve.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Malformed PEM, DER, JWK or JWS input.
    #[error("parse error: {0}")]
    Parse(String),

    /// A required JWS protected header field is absent or empty.
    #[error("missing header field: {0}")]
    MissingHeaderField(&'static str),

    /// Signature does not verify, or the algorithm does not fit the key.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::Parse(err.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::Parse(err.to_string())
    }
}

/// Typed causes carried by the client's `eyre` errors.
///
/// Recover them with [`eyre::Report::downcast_ref`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no nonce available for {url}")]
    NoNonceAvailable { url: String },

    #[error("polling {url} gave up after {attempts} attempts")]
    PollLimitExceeded { url: String, attempts: usize },

    #[error("directory has no {0} endpoint")]
    MissingEndpoint(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Problem(Problem),
}

impl ClientError {
    /// Returns the server's problem document, if this is one.
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            ClientError::Problem(problem) => Some(problem),
            _ => None,
        }
    }
}

impl From<Problem> for eyre::Error {
    fn from(err: Problem) -> eyre::Error {
        eyre::Report::new(ClientError::Problem(err))
    }
}
