//! Error types for vigil-scan
//!
//! `ScanError` is the domain taxonomy returned by admission, orchestration and
//! threshold operations. `ApiError` maps it onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::resolution_client::ResolutionError;

/// Domain errors surfaced to callers of the scan pipeline
#[derive(Debug, Error)]
pub enum ScanError {
    /// Malformed request; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Quota exceeded: {used}/{limit} scans used this period")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("Account has not consented to scanning")]
    ConsentDenied,

    /// Resolver kept rate-limiting after all retries
    #[error("Recognition service is rate limiting requests")]
    RateLimited,

    /// Resolver unreachable or returning 5xx after all retries
    #[error("Recognition service unavailable")]
    ServiceUnavailable,

    /// Resolver rejected the request; upstream detail deliberately withheld
    #[error("Recognition service rejected the request")]
    UpstreamInvalid,

    #[error("Timed out waiting for recognition result")]
    PollTimeout,

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted lifecycle edge not allowed by the scan state machine
    #[error("Illegal scan transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Common(#[from] vigil_common::Error),
}

impl From<sqlx::Error> for ScanError {
    fn from(err: sqlx::Error) -> Self {
        ScanError::Common(vigil_common::Error::Database(err))
    }
}

impl From<ResolutionError> for ScanError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::RateLimited => ScanError::RateLimited,
            ResolutionError::ServerError(_)
            | ResolutionError::Network(_)
            | ResolutionError::Timeout(_)
            | ResolutionError::TooManyRedirects(_)
            | ResolutionError::Credential(_) => ScanError::ServiceUnavailable,
            ResolutionError::ClientError(_)
            | ResolutionError::Parse(_)
            | ResolutionError::JobFailed(_) => ScanError::UpstreamInvalid,
            ResolutionError::PollTimeout => ScanError::PollTimeout,
        }
    }
}

pub type ScanResult<T> = Result<T, ScanError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Invalid request body (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Scan(err) => {
                let message = err.to_string();
                match err {
                    ScanError::Validation(_) => {
                        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
                    }
                    ScanError::QuotaExceeded { .. } => {
                        (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED", message)
                    }
                    ScanError::ConsentDenied => (StatusCode::FORBIDDEN, "CONSENT_DENIED", message),
                    ScanError::RateLimited => {
                        (StatusCode::TOO_MANY_REQUESTS, "UPSTREAM_RATE_LIMITED", message)
                    }
                    ScanError::ServiceUnavailable => {
                        (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
                    }
                    ScanError::UpstreamInvalid => {
                        (StatusCode::BAD_GATEWAY, "UPSTREAM_INVALID", message)
                    }
                    ScanError::PollTimeout => {
                        (StatusCode::GATEWAY_TIMEOUT, "POLL_TIMEOUT", message)
                    }
                    ScanError::InvalidThreshold(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_THRESHOLD", message)
                    }
                    ScanError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
                    ScanError::InvalidTransition(_) => {
                        (StatusCode::CONFLICT, "INVALID_TRANSITION", message)
                    }
                    ScanError::Common(ref inner) => {
                        tracing::error!(error = %inner, "Internal error serving request");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "INTERNAL_ERROR",
                            "Internal server error".to_string(),
                        )
                    }
                }
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_errors_collapse_to_caller_classes() {
        assert!(matches!(
            ScanError::from(ResolutionError::ServerError(502)),
            ScanError::ServiceUnavailable
        ));
        assert!(matches!(
            ScanError::from(ResolutionError::ClientError(418)),
            ScanError::UpstreamInvalid
        ));
        assert!(matches!(
            ScanError::from(ResolutionError::RateLimited),
            ScanError::RateLimited
        ));
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ScanError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ScanError::QuotaExceeded { used: 1, limit: 1 }, StatusCode::TOO_MANY_REQUESTS),
            (ScanError::ConsentDenied, StatusCode::FORBIDDEN),
            (ScanError::ServiceUnavailable, StatusCode::SERVICE_UNAVAILABLE),
            (ScanError::UpstreamInvalid, StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
