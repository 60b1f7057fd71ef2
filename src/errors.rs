//! Sequencer error taxonomy
//!
//! Every error carries a stable numeric code and an HTTP status. Codes in
//! 40001-49999 are client errors, 50001-59999 server errors. Codes are
//! never reassigned; gaps in the numbering are historical and stay unfilled.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // ============ Client errors ============
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid census proof")]
    InvalidCensusProof,

    #[error("invalid ballot proof")]
    InvalidBallotProof,

    #[error("ballot violates ballot mode constraints: {0}")]
    ConstraintViolation(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("process not found")]
    ProcessNotFound,

    #[error("key too long for tree with {max_levels} levels")]
    KeyTooLong { max_levels: usize },

    // ============ Server errors ============
    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Transient(String),

    #[error("prover error: {0}")]
    Prover(String),
}

impl Error {
    /// Stable wire code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::MalformedInput(_) => 40001,
            Error::InvalidSignature => 40002,
            Error::InvalidCensusProof => 40003,
            Error::InvalidBallotProof => 40004,
            Error::ConstraintViolation(_) => 40005,
            Error::AlreadyExists(_) => 40007,
            Error::NotFound(_) => 40009,
            Error::ProcessNotFound => 40012,
            Error::KeyTooLong { .. } => 40014,
            Error::Internal(_) => 50001,
            Error::Transient(_) => 50002,
            Error::Prover(_) => 50003,
        }
    }

    /// HTTP status for this error. Fixed per code, never reassigned.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedInput(_)
            | Error::InvalidSignature
            | Error::InvalidCensusProof
            | Error::InvalidBallotProof
            | Error::ConstraintViolation(_)
            | Error::KeyTooLong { .. } => StatusCode::BAD_REQUEST,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::NotFound(_) | Error::ProcessNotFound => StatusCode::NOT_FOUND,
            Error::Internal(_) | Error::Transient(_) | Error::Prover(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}

/// Wire envelope for error responses.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u32,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::MalformedInput("x".into()).code(), 40001);
        assert_eq!(Error::InvalidSignature.code(), 40002);
        assert_eq!(Error::InvalidCensusProof.code(), 40003);
        assert_eq!(Error::InvalidBallotProof.code(), 40004);
        assert_eq!(Error::AlreadyExists("census".into()).code(), 40007);
        assert_eq!(Error::NotFound("census".into()).code(), 40009);
        assert_eq!(Error::ProcessNotFound.code(), 40012);
        assert_eq!(Error::Internal("x".into()).code(), 50001);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::InvalidSignature.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::AlreadyExists("census".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(Error::ProcessNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Transient("io".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
