//! API request handlers.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;
use std::sync::Arc;

use crate::core::types::CallerId;
use crate::server::JobServer;

use super::errors::ApiError;
use super::responses::{CallResponse, HealthResponse};

/// Header carrying the caller identity established by the auth layer in
/// front of this facade.
pub const CALLER_HEADER: &str = "x-caller-id";

/// Shared application state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<JobServer>,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Dispatch one method call.
///
/// The request body is the method's params object; the caller identity
/// comes from the `x-caller-id` header. Calls without the header are
/// anonymous and will only pass a gate that admits them explicitly.
pub async fn call(
    State(state): State<ApiState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    Json(params): Json<Value>,
) -> Result<Json<CallResponse>, ApiError> {
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(CallerId::new)
        .unwrap_or_else(|| CallerId::new("anonymous"));

    let result = state
        .server
        .dispatch(Some(&caller), &method, params)
        .await?;
    Ok(Json(CallResponse { result }))
}
