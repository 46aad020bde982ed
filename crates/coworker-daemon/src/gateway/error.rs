//! Wire error taxonomy for the HTTP gateway.
//!
//! Every failure crossing the HTTP boundary is one of a closed set of
//! stable codes; bodies are `{error, code}` JSON. Internal failures never
//! leak store or filesystem detail beyond a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid session credentials.
    #[error("missing or invalid session credentials")]
    Unauthorized,

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request shape or parameter values are unacceptable.
    #[error("{0}")]
    InvalidArgument(String),

    /// A declared path escapes the configured workspace roots.
    #[error("{0}")]
    Forbidden(String),

    /// The job has not produced a result yet.
    #[error("job has no result yet")]
    NotReady,

    /// The referenced entity is in the wrong state for the operation.
    #[error("{0}")]
    BadState(String),

    /// A mutating tool was submitted without an approval token.
    #[error("approval_token is required for mutating tools")]
    ApprovalRequired,

    /// The approval's TTL elapsed.
    #[error("approval token expired")]
    Expired,

    /// The supplied hash or binding does not match stored state.
    #[error("{0}")]
    Mismatch(String),

    /// Infrastructure failure; safe generic message only.
    #[error("internal error")]
    Internal,
}

impl ApiError {
    /// The stable wire code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::NotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Forbidden(_) => "Forbidden",
            Self::NotReady => "NotReady",
            Self::BadState(_) => "BadState",
            Self::ApprovalRequired => "ApprovalRequired",
            Self::Expired => "Expired",
            Self::Mismatch(_) => "Mismatch",
            Self::Internal => "Internal",
        }
    }

    /// The HTTP status this error maps to.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidArgument(_) | Self::BadState(_) | Self::ApprovalRequired => {
                StatusCode::BAD_REQUEST
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotReady => StatusCode::CONFLICT,
            Self::Expired | Self::Mismatch(_) => StatusCode::GONE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PlanNotFound { plan_job_id } => {
                Self::NotFound(format!("plan job not found: {plan_job_id}"))
            }
            StoreError::PlanNotSucceeded { plan_job_id } => {
                Self::BadState(format!("plan job {plan_job_id} has not succeeded"))
            }
            StoreError::PlanHashMismatch { plan_job_id } => {
                Self::Mismatch(format!("plan hash mismatch for {plan_job_id}"))
            }
            StoreError::ApprovalRequired { .. } => Self::ApprovalRequired,
            StoreError::ApprovalExpired => Self::Expired,
            StoreError::ApprovalUnknown => {
                Self::Mismatch("unknown approval token".to_string())
            }
            StoreError::ApprovalMismatch { .. } => {
                Self::Mismatch("approval bound to a different plan".to_string())
            }
            StoreError::UnknownToolType { type_id } => {
                Self::InvalidArgument(format!("unknown tool type: {type_id}"))
            }
            StoreError::Database(_)
            | StoreError::Serde(_)
            | StoreError::LockPoisoned
            | StoreError::Preempted { .. } => Self::Internal,
        }
    }
}
