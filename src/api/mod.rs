//! HTTP facade over the method registry.
//!
//! The wire protocol proper is an external collaborator; this module is the
//! thin stand-in shipped for deployments without one: every method is
//! reachable as `POST /api/call/{method}` with the params object as the
//! body. Authentication sits in front of the facade and asserts the caller
//! identity via the `x-caller-id` header.

mod errors;
mod handlers;
mod responses;

pub use errors::ApiError;
pub use handlers::{ApiState, CALLER_HEADER};
pub use responses::*;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::server::JobServer;

/// Build the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/call/{method}", post(handlers::call))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the API server.
///
/// Spawns the server and returns a handle to the task. The server runs
/// until the task is aborted or the process exits.
pub async fn start_server(
    config: ApiConfig,
    server: Arc<JobServer>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(ApiState { server });
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
