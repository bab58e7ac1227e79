//! Challenge responders.
//!
//! Each validator answers one challenge for one domain: it is built from the client's
//! [`ChallengeResponse`], then serves proof of control between `start` and `stop`.

use crate::api::ChallengeResponse;

mod dns01;
mod http01;
mod tls_sni01;

pub use self::{
    dns01::{dns_txt_value, Dns01Validator},
    http01::Http01Validator,
    tls_sni01::{sni_names, TlsSni01Validator},
};

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// The fields every validator needs.
#[derive(Debug, Clone)]
struct Answer {
    token: String,
    key_authorization: String,
}

impl Answer {
    fn from_response(
        expected_type: &str,
        response: &ChallengeResponse,
    ) -> Result<Self, ValidatorError> {
        let missing = |field: &str| ValidatorError::MalformedChallenge(format!("missing {field}"));

        let challenge_type = response._type.as_deref().ok_or_else(|| missing("type"))?;
        if challenge_type != expected_type {
            return Err(ValidatorError::MalformedChallenge(format!(
                "expected {expected_type} challenge, got {challenge_type}"
            )));
        }

        Ok(Answer {
            token: response.token.clone().ok_or_else(|| missing("token"))?,
            key_authorization: response
                .key_authorization
                .clone()
                .ok_or_else(|| missing("keyAuthorization"))?,
        })
    }
}
