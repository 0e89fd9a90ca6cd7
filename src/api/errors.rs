//! API error types and HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::server::ServerError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Caller failed the permission gate.
    Unauthorized,
    /// Bad method name.
    NotFound(String),
    /// Bad parameters.
    BadRequest(String),
    /// Conflicting installation (e.g. call log already set).
    Conflict(String),
    /// The record store is unreachable.
    Unavailable(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::FORBIDDEN,
                "UNAUTHORIZED",
                "not authorized".to_string(),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Unauthorized => ApiError::Unauthorized,
            ServerError::UnknownMethod(msg) => ApiError::NotFound(msg),
            ServerError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            ServerError::CallLogInstalled => {
                ApiError::Conflict("call log already installed".to_string())
            }
            ServerError::Store(e) => ApiError::Unavailable(e.to_string()),
            ServerError::Channel(msg) => ApiError::Internal(msg),
        }
    }
}
