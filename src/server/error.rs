use actix_web::{http::StatusCode, HttpResponse, ResponseError};

use crate::{
    api::{Problem, ProblemKind},
    cert::CsrError,
    error::CryptoError,
};

/// Request failures and the responses they turn into.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// 400 `malformed`.
    #[error("{title}")]
    Malformed {
        title: String,
        description: Option<String>,
    },

    /// 401 `unauthorized`.
    #[error("{0}")]
    Unauthorized(String),

    /// 400 `badNonce`.
    #[error("bad nonce")]
    BadNonce,

    /// 404 with an empty body.
    #[error("not found")]
    NotFound,

    /// 409 pointing at the existing resource.
    #[error("conflict with {location}")]
    Conflict { location: String },

    /// 500 `serverInternal`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn malformed(title: &str) -> Self {
        ServerError::Malformed {
            title: title.to_owned(),
            description: None,
        }
    }

    pub fn malformed_because(title: &str, description: impl ToString) -> Self {
        ServerError::Malformed {
            title: title.to_owned(),
            description: Some(description.to_string()),
        }
    }

    pub fn unauthorized(title: &str) -> Self {
        ServerError::Unauthorized(title.to_owned())
    }

    fn problem(&self) -> Option<Problem> {
        let problem = match self {
            ServerError::Malformed { title, description } => {
                Problem::new(ProblemKind::Malformed, title, description.clone())
            }

            ServerError::Unauthorized(title) => Problem::new(ProblemKind::Unauthorized, title, None),

            ServerError::BadNonce => Problem::new(
                ProblemKind::BadNonce,
                "Bad nonce",
                Some("The nonce was missing, already used or never issued".to_owned()),
            ),

            ServerError::Internal(description) => Problem::new(
                ProblemKind::ServerInternal,
                "Internal server error",
                Some(description.clone()),
            ),

            ServerError::NotFound | ServerError::Conflict { .. } => return None,
        };

        Some(problem)
    }
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Malformed { .. } | ServerError::BadNonce => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            ServerError::Conflict { .. } => StatusCode::CONFLICT,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code());

        if let ServerError::Conflict { location } = self {
            res.insert_header(("Location", location.as_str()));
        }

        match self.problem() {
            Some(problem) => res
                .content_type("application/problem+json")
                .json(problem),
            None => res.finish(),
        }
    }
}

impl From<CryptoError> for ServerError {
    fn from(err: CryptoError) -> Self {
        ServerError::malformed_because("Request signature verification failed", err)
    }
}

impl From<CsrError> for ServerError {
    fn from(err: CsrError) -> Self {
        ServerError::malformed_because("Invalid CSR", err)
    }
}
