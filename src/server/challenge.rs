//! Server-side challenge state.

use std::fmt;

use async_trait::async_trait;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::ServerError;
use crate::{
    api::{self, ChallengeStatus, ProblemKind},
    util::base64url,
};

/// Iterations advertised for `tls-sni-01`.
pub const TLS_SNI_ITERATIONS: u32 = 1;

/// The challenge kinds a server can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,

    #[serde(rename = "dns-01")]
    Dns01,

    #[serde(rename = "tls-sni-01")]
    TlsSni01,

    /// Accepts any response echoing the token. For tests only.
    #[serde(rename = "auto")]
    Auto,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsSni01 => "tls-sni-01",
            ChallengeType::Auto => "auto",
        }
    }

    /// Creates a pending challenge of this type with a fresh token.
    pub fn instantiate(self) -> Box<dyn Challenge> {
        let state = ChallengeState::new();

        match self {
            ChallengeType::Http01 => Box::new(Http01 { state }),
            ChallengeType::Dns01 => Box::new(Dns01 { state }),
            ChallengeType::TlsSni01 => Box::new(TlsSni01 {
                state,
                n: TLS_SNI_ITERATIONS,
            }),
            ChallengeType::Auto => Box::new(Auto { state }),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a challenge needs to know about its authorization.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// The domain being authorized.
    pub identifier: String,

    /// Thumbprint of the owning account key.
    pub thumbprint: String,
}

impl ValidationContext {
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint)
    }
}

/// Fields every challenge carries.
#[derive(Debug, Clone)]
pub struct ChallengeState {
    pub token: String,
    pub status: ChallengeStatus,
    pub validated: Option<OffsetDateTime>,
    pub error: Option<api::Problem>,
}

impl ChallengeState {
    fn new() -> Self {
        let mut token = [0; 16];
        rand::thread_rng().fill_bytes(&mut token);

        ChallengeState {
            token: base64url(&token),
            status: ChallengeStatus::Pending,
            validated: None,
            error: None,
        }
    }

    fn pass(&mut self) {
        self.status = ChallengeStatus::Valid;
        self.validated = Some(OffsetDateTime::now_utc());
        self.error = None;
    }

    fn fail(&mut self, title: &str, description: String) {
        self.status = ChallengeStatus::Invalid;
        self.error = Some(api::Problem::new(
            ProblemKind::Unauthorized,
            title,
            Some(description),
        ));
    }

    /// Settles the challenge on the client's key authorization.
    ///
    /// The live lookup against the domain is not performed; the response must carry the
    /// authorization bound to this token and account.
    fn settle_key_authorization(
        &mut self,
        ctx: &ValidationContext,
        response: &api::ChallengeResponse,
    ) {
        let expected = ctx.key_authorization(&self.token);

        match response.key_authorization.as_deref() {
            Some(key_auth) if key_auth == expected => self.pass(),
            Some(key_auth) => self.fail(
                "Incorrect key authorization",
                format!("expected {expected}, got {key_auth}"),
            ),
            None => self.fail(
                "Missing key authorization",
                format!("no keyAuthorization for {}", ctx.identifier),
            ),
        }
    }
}

/// A way of proving control over an identifier.
#[async_trait]
pub trait Challenge: fmt::Debug + Send + Sync {
    fn challenge_type(&self) -> ChallengeType;

    fn state(&self) -> &ChallengeState;

    fn state_mut(&mut self) -> &mut ChallengeState;

    /// Applies the client's response, settling the challenge as valid or invalid.
    ///
    /// A response addressed to a different challenge type is rejected without touching the
    /// challenge.
    async fn update(
        &mut self,
        ctx: &ValidationContext,
        response: &api::ChallengeResponse,
    ) -> Result<(), ServerError>;

    fn to_view(&self, url: &str) -> api::Challenge {
        view(self, url)
    }

    fn clone_box(&self) -> Box<dyn Challenge>;
}

impl Clone for Box<dyn Challenge> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

fn view<C: Challenge + ?Sized>(challenge: &C, url: &str) -> api::Challenge {
    let state = challenge.state();

    api::Challenge {
        _type: challenge.challenge_type().as_str().to_owned(),
        url: url.to_owned(),
        status: state.status,
        token: state.token.clone(),
        n: None,
        validated: state
            .validated
            .and_then(|validated| validated.format(&Rfc3339).ok()),
        error: state.error.clone(),
    }
}

fn check_type(expected: ChallengeType, response: &api::ChallengeResponse) -> Result<(), ServerError> {
    match response._type.as_deref() {
        None => Ok(()),
        Some(given) if given == expected.as_str() => Ok(()),
        Some(given) => Err(ServerError::malformed_because(
            "Challenge type mismatch",
            format!("response for {given} sent to a {expected} challenge"),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct Http01 {
    state: ChallengeState,
}

#[async_trait]
impl Challenge for Http01 {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Http01
    }

    fn state(&self) -> &ChallengeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ChallengeState {
        &mut self.state
    }

    async fn update(
        &mut self,
        ctx: &ValidationContext,
        response: &api::ChallengeResponse,
    ) -> Result<(), ServerError> {
        check_type(ChallengeType::Http01, response)?;
        self.state.settle_key_authorization(ctx, response);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Challenge> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Dns01 {
    state: ChallengeState,
}

#[async_trait]
impl Challenge for Dns01 {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Dns01
    }

    fn state(&self) -> &ChallengeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ChallengeState {
        &mut self.state
    }

    async fn update(
        &mut self,
        ctx: &ValidationContext,
        response: &api::ChallengeResponse,
    ) -> Result<(), ServerError> {
        check_type(ChallengeType::Dns01, response)?;
        self.state.settle_key_authorization(ctx, response);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Challenge> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TlsSni01 {
    state: ChallengeState,
    n: u32,
}

#[async_trait]
impl Challenge for TlsSni01 {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::TlsSni01
    }

    fn state(&self) -> &ChallengeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ChallengeState {
        &mut self.state
    }

    async fn update(
        &mut self,
        ctx: &ValidationContext,
        response: &api::ChallengeResponse,
    ) -> Result<(), ServerError> {
        check_type(ChallengeType::TlsSni01, response)?;
        self.state.settle_key_authorization(ctx, response);
        Ok(())
    }

    fn to_view(&self, url: &str) -> api::Challenge {
        api::Challenge {
            n: Some(self.n),
            ..view(self, url)
        }
    }

    fn clone_box(&self) -> Box<dyn Challenge> {
        Box::new(self.clone())
    }
}

/// Valid as soon as the response echoes the token.
#[derive(Debug, Clone)]
pub struct Auto {
    state: ChallengeState,
}

#[async_trait]
impl Challenge for Auto {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Auto
    }

    fn state(&self) -> &ChallengeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ChallengeState {
        &mut self.state
    }

    async fn update(
        &mut self,
        _ctx: &ValidationContext,
        response: &api::ChallengeResponse,
    ) -> Result<(), ServerError> {
        let echoed = response._type.as_deref() == Some("auto")
            && response.token.as_deref() == Some(self.state.token.as_str());

        if echoed {
            self.state.pass();
        } else {
            self.state
                .fail("Token mismatch", "response did not echo the token".to_owned());
        }

        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Challenge> {
        Box::new(self.clone())
    }
}
