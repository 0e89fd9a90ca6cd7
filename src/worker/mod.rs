//! Worker-side machinery: the pull-based job queue and the client view of a
//! remote job server.
//!
//! A worker host instantiates a [`JobQueue`] over a [`JobClient`] and a
//! user-supplied [`Worker`] implementation. The queue pulls ready jobs,
//! bounds concurrency, and reports outcomes back through the client.

mod client;
mod queue;

pub use client::{ClientError, JobClient, LocalClient};
pub use queue::{JobQueue, QueueError, QueueHandle, QueueState, ShutdownLevel};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::core::job::{JobDoc, LogLevel};
use crate::core::types::{JobId, RunId};

/// Server reply to a worker report.
///
/// `Rejected` means the conditional update missed: the run was superseded or
/// the job left the running state (cancel, shutdown sweep). `Stopped` means
/// the server is shutting down. Either way the worker should drop the job
/// and stop reporting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The report was applied.
    Accepted,
    /// The precondition no longer held; the job is no longer this run's.
    Rejected,
    /// The server is stopped; go quiet.
    Stopped,
}

impl Ack {
    /// Whether the job is still live for this run.
    pub fn is_live(&self) -> bool {
        *self == Ack::Accepted
    }

    /// Decode the wire reply (`true` / `false` / `null`).
    pub fn from_value(value: &Value) -> Ack {
        match value {
            Value::Bool(true) => Ack::Accepted,
            Value::Bool(false) => Ack::Rejected,
            _ => Ack::Stopped,
        }
    }
}

/// A claimed job held by the worker, with its reporting surface.
///
/// The user's worker must resolve every handle exactly once with
/// [`JobHandle::done`] or [`JobHandle::fail`] before returning; a handle
/// whose report comes back non-live is dropped and needs no resolution.
pub struct JobHandle {
    doc: JobDoc,
    run_id: RunId,
    client: Arc<dyn JobClient>,
    resolved: bool,
    dropped: bool,
}

impl JobHandle {
    pub(crate) fn new(doc: JobDoc, run_id: RunId, client: Arc<dyn JobClient>) -> Self {
        Self {
            doc,
            run_id,
            client,
            resolved: false,
            dropped: false,
        }
    }

    /// The claimed document.
    pub fn doc(&self) -> &JobDoc {
        &self.doc
    }

    /// The job's opaque payload.
    pub fn data(&self) -> &Value {
        &self.doc.data
    }

    /// The job id.
    pub fn id(&self) -> JobId {
        self.doc.id
    }

    /// The run this handle owns.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Whether done or fail has been called.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Whether a non-live reply told us to drop the job.
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    fn observe(&mut self, ack: Ack) -> Ack {
        if !ack.is_live() {
            self.dropped = true;
        }
        ack
    }

    /// Report progress. A non-live reply means the run was cancelled or
    /// superseded; abort the work.
    pub async fn progress(&mut self, completed: f64, total: f64) -> Result<Ack, ClientError> {
        let ack = self
            .client
            .progress(self.doc.id, self.run_id, completed, total)
            .await?;
        Ok(self.observe(ack))
    }

    /// Append a log entry to the job.
    pub async fn log(&mut self, message: &str, level: LogLevel) -> Result<Ack, ClientError> {
        let ack = self
            .client
            .log(self.doc.id, self.run_id, message, level)
            .await?;
        Ok(self.observe(ack))
    }

    /// Resolve the job as completed with a result payload.
    pub async fn done(&mut self, result: Value) -> Result<Ack, ClientError> {
        if self.resolved {
            tracing::warn!(job_id = %self.doc.id, "Job already resolved; ignoring done");
            return Ok(Ack::Rejected);
        }
        self.resolved = true;
        let ack = self.client.done(self.doc.id, self.run_id, result).await?;
        Ok(self.observe(ack))
    }

    /// Resolve the job as failed.
    pub async fn fail(&mut self, err: Value, fatal: bool) -> Result<Ack, ClientError> {
        if self.resolved {
            tracing::warn!(job_id = %self.doc.id, "Job already resolved; ignoring fail");
            return Ok(Ack::Rejected);
        }
        self.resolved = true;
        let ack = self.client.fail(self.doc.id, self.run_id, err, fatal).await?;
        Ok(self.observe(ack))
    }
}

/// User-supplied work implementation.
///
/// One invocation receives one cargo of jobs. Every handle must be resolved
/// with done or fail before the future completes; the queue fails any handle
/// left unresolved.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn perform(&self, jobs: &mut [JobHandle]);
}
