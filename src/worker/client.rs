//! The worker's view of a remote job server.
//!
//! The transport is an external collaborator; this trait is the surface the
//! queue consumes. [`LocalClient`] drives an in-process server through its
//! method registry with JSON at the boundary, exactly as a remote transport
//! would, so the permission gate and call journal apply to it too.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use super::Ack;
use crate::core::job::{JobDoc, LogLevel};
use crate::core::types::{CallerId, JobId, RunId};
use crate::server::{JobServer, ServerError};

/// Errors crossing the client boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport failed or the reply was malformed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected or failed the call.
    #[error("server error: {0}")]
    Server(String),
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        ClientError::Server(err.to_string())
    }
}

/// Client surface the worker-side queue pulls work through.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Request up to `max_jobs` ready jobs of the given types.
    async fn get_work(&self, types: &[String], max_jobs: usize)
        -> Result<Vec<JobDoc>, ClientError>;

    /// Report progress for a run.
    async fn progress(
        &self,
        id: JobId,
        run_id: RunId,
        completed: f64,
        total: f64,
    ) -> Result<Ack, ClientError>;

    /// Append a log entry to a run.
    async fn log(
        &self,
        id: JobId,
        run_id: RunId,
        message: &str,
        level: LogLevel,
    ) -> Result<Ack, ClientError>;

    /// Report a run completed.
    async fn done(&self, id: JobId, run_id: RunId, result: Value) -> Result<Ack, ClientError>;

    /// Report a run failed.
    async fn fail(
        &self,
        id: JobId,
        run_id: RunId,
        err: Value,
        fatal: bool,
    ) -> Result<Ack, ClientError>;
}

/// In-process client over a [`JobServer`].
pub struct LocalClient {
    server: Arc<JobServer>,
    caller: CallerId,
}

impl LocalClient {
    /// Create a client calling as the given identity.
    pub fn new(server: Arc<JobServer>, caller: impl Into<CallerId>) -> Self {
        Self {
            server,
            caller: caller.into(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.server
            .dispatch(Some(&self.caller), method, params)
            .await
            .map_err(ClientError::from)
    }
}

#[async_trait]
impl JobClient for LocalClient {
    async fn get_work(
        &self,
        types: &[String],
        max_jobs: usize,
    ) -> Result<Vec<JobDoc>, ClientError> {
        let reply = self
            .call(
                "getWork",
                json!({"types": types, "options": {"maxJobs": max_jobs}}),
            )
            .await?;
        serde_json::from_value(reply).map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn progress(
        &self,
        id: JobId,
        run_id: RunId,
        completed: f64,
        total: f64,
    ) -> Result<Ack, ClientError> {
        let reply = self
            .call(
                "jobProgress",
                json!({"id": id, "runId": run_id, "completed": completed, "total": total}),
            )
            .await?;
        Ok(Ack::from_value(&reply))
    }

    async fn log(
        &self,
        id: JobId,
        run_id: RunId,
        message: &str,
        level: LogLevel,
    ) -> Result<Ack, ClientError> {
        let reply = self
            .call(
                "jobLog",
                json!({
                    "id": id,
                    "runId": run_id,
                    "message": message,
                    "options": {"level": level}
                }),
            )
            .await?;
        Ok(Ack::from_value(&reply))
    }

    async fn done(&self, id: JobId, run_id: RunId, result: Value) -> Result<Ack, ClientError> {
        let reply = self
            .call(
                "jobDone",
                json!({"id": id, "runId": run_id, "result": result}),
            )
            .await?;
        Ok(Ack::from_value(&reply))
    }

    async fn fail(
        &self,
        id: JobId,
        run_id: RunId,
        err: Value,
        fatal: bool,
    ) -> Result<Ack, ClientError> {
        let reply = self
            .call(
                "jobFail",
                json!({"id": id, "runId": run_id, "err": err, "options": {"fatal": fatal}}),
            )
            .await?;
        Ok(Ack::from_value(&reply))
    }
}
