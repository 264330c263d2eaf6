//! API error taxonomy mapped onto HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use crate::engine::join::JoinError;

#[derive(Debug)]
pub enum ApiError {
    /// Malformed payload, out-of-window join, unknown market. Never retried.
    Validation(String),
    /// Missing or mismatched header secret.
    Auth,
    RateLimited { retry_after_sec: u64 },
    /// A pause gate is set; no state change happened.
    Paused,
    Internal(anyhow::Error),
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        match err {
            JoinError::Paused => ApiError::Paused,
            JoinError::RateLimited { retry_after_sec, .. } => {
                ApiError::RateLimited { retry_after_sec }
            }
            JoinError::Validation(msg) => ApiError::Validation(msg),
            JoinError::Transient(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Auth => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response(),
            ApiError::RateLimited { retry_after_sec } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_sec.to_string())],
                Json(json!({
                    "error": "rate_limit_exceeded",
                    "retryAfterSec": retry_after_sec,
                })),
            )
                .into_response(),
            ApiError::Paused => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "paused" })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal" })),
                )
                    .into_response()
            }
        }
    }
}
