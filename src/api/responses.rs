//! API response types.

use serde::Serialize;
use serde_json::Value;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Envelope for a dispatched method's return value.
#[derive(Debug, Serialize)]
pub struct CallResponse {
    pub result: Value,
}
