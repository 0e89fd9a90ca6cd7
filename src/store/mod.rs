//! Record store abstraction for persisting job documents.
//!
//! This module provides a trait-based store abstraction with pluggable
//! backends (in-memory, SQLite). The trait surface is deliberately small:
//! reads, insert, and *conditional* updates. Every state transition in the
//! server is expressed as an update whose query names the expected current
//! status (and run id where relevant), so the backend's single-document
//! atomicity is what enforces the state machine under concurrency.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::core::job::{JobDoc, JobStatus, LogEntry, Progress};
use crate::core::types::{JobId, RunId};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A document with the same id already exists.
    #[error("duplicate job id: {0}")]
    DuplicateId(JobId),

    /// Store lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Generic store error.
    #[error("store error: {0}")]
    Other(String),
}

/// Which fields a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// The full document including the log.
    Full,
    /// The document with the log elided (the common read for listings).
    #[default]
    WithoutLog,
}

/// A conjunctive filter over job documents.
///
/// Every populated field must match. Conditional-update queries populate
/// `ids`/`statuses` (and `run_id` for running-state transitions) so the CAS
/// precondition travels with the write.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Match any of these ids.
    pub ids: Option<Vec<JobId>>,
    /// Match any of these statuses.
    pub statuses: Option<Vec<JobStatus>>,
    /// Match any of these job types.
    pub types: Option<Vec<String>>,
    /// Match this exact current run id.
    pub run_id: Option<RunId>,
    /// Match jobs whose `after` is at or before this instant.
    pub after_at_or_before: Option<DateTime<Utc>>,
    /// Match on whether `depends` is empty.
    pub depends_empty: Option<bool>,
    /// Match jobs whose `depends` contains this id.
    pub depends_contains: Option<JobId>,
    /// Match on whether the repeat budget is the forever sentinel.
    pub repeats_forever: Option<bool>,
    /// Match this exact `data` payload.
    pub data: Option<Value>,
}

impl JobQuery {
    /// Query for a single job by id.
    pub fn by_id(id: JobId) -> Self {
        Self {
            ids: Some(vec![id]),
            ..Self::default()
        }
    }

    /// Query for several jobs by id.
    pub fn by_ids(ids: Vec<JobId>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    /// Restrict to a single status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Restrict to any of the given statuses.
    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    /// Restrict to any of the given job types.
    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types);
        self
    }

    /// Restrict to the given current run id.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Restrict to jobs eligible at `now` (`after <= now`).
    pub fn due_at(mut self, now: DateTime<Utc>) -> Self {
        self.after_at_or_before = Some(now);
        self
    }

    /// Restrict to jobs with no unresolved dependencies.
    pub fn with_no_depends(mut self) -> Self {
        self.depends_empty = Some(true);
        self
    }

    /// Restrict to jobs depending on the given id.
    pub fn depending_on(mut self, id: JobId) -> Self {
        self.depends_contains = Some(id);
        self
    }

    /// Restrict to jobs whose repeat budget is the forever sentinel.
    pub fn repeating_forever(mut self) -> Self {
        self.repeats_forever = Some(true);
        self
    }

    /// Restrict to jobs carrying this exact data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether the document satisfies every populated filter.
    pub fn matches(&self, doc: &JobDoc) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&doc.id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&doc.status) {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &doc.job_type) {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if doc.run_id.as_ref() != Some(run_id) {
                return false;
            }
        }
        if let Some(at) = &self.after_at_or_before {
            if doc.after > *at {
                return false;
            }
        }
        if let Some(empty) = self.depends_empty {
            if doc.depends.is_empty() != empty {
                return false;
            }
        }
        if let Some(id) = &self.depends_contains {
            if !doc.depends.contains(id) {
                return false;
            }
        }
        if let Some(forever) = self.repeats_forever {
            if doc.repeats.is_forever() != forever {
                return false;
            }
        }
        if let Some(data) = &self.data {
            if &doc.data != data {
                return false;
            }
        }
        true
    }
}

/// One field-level operation within a mutation.
#[derive(Debug, Clone)]
pub enum FieldOp {
    /// Set the lifecycle status.
    SetStatus(JobStatus),
    /// Set or clear the current run id.
    SetRunId(Option<RunId>),
    /// Set the earliest eligibility time.
    SetAfter(DateTime<Utc>),
    /// Refresh the last-mutation timestamp.
    SetUpdated(DateTime<Utc>),
    /// Set completion progress.
    SetProgress(Progress),
    /// Set the result payload.
    SetResult(Value),
    /// Append a log entry.
    PushLog(LogEntry),
    /// Consume one retry: `retries -= 1` (forever saturates), `retried += 1`.
    ConsumeRetry,
    /// Restock the retry budget by the given count.
    RestockRetries(u32),
    /// Move an id from `depends` to `resolved`. Idempotent: a second
    /// application is a no-op.
    ResolveDependency(JobId),
}

/// An ordered list of field operations applied atomically to one document.
#[derive(Debug, Clone, Default)]
pub struct JobMutation {
    ops: Vec<FieldOp>,
}

impl JobMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(mut self, status: JobStatus) -> Self {
        self.ops.push(FieldOp::SetStatus(status));
        self
    }

    pub fn set_run_id(mut self, run_id: Option<RunId>) -> Self {
        self.ops.push(FieldOp::SetRunId(run_id));
        self
    }

    pub fn set_after(mut self, after: DateTime<Utc>) -> Self {
        self.ops.push(FieldOp::SetAfter(after));
        self
    }

    pub fn set_updated(mut self, updated: DateTime<Utc>) -> Self {
        self.ops.push(FieldOp::SetUpdated(updated));
        self
    }

    pub fn set_progress(mut self, progress: Progress) -> Self {
        self.ops.push(FieldOp::SetProgress(progress));
        self
    }

    pub fn set_result(mut self, result: Value) -> Self {
        self.ops.push(FieldOp::SetResult(result));
        self
    }

    pub fn push_log(mut self, entry: LogEntry) -> Self {
        self.ops.push(FieldOp::PushLog(entry));
        self
    }

    pub fn consume_retry(mut self) -> Self {
        self.ops.push(FieldOp::ConsumeRetry);
        self
    }

    pub fn restock_retries(mut self, count: u32) -> Self {
        self.ops.push(FieldOp::RestockRetries(count));
        self
    }

    pub fn resolve_dependency(mut self, id: JobId) -> Self {
        self.ops.push(FieldOp::ResolveDependency(id));
        self
    }

    /// The operations in application order.
    pub fn ops(&self) -> &[FieldOp] {
        &self.ops
    }

    /// Apply every operation to the document in order.
    pub fn apply(&self, doc: &mut JobDoc) {
        for op in &self.ops {
            match op {
                FieldOp::SetStatus(status) => {
                    debug_assert!(
                        doc.status.can_transition(*status),
                        "illegal transition {} -> {}",
                        doc.status,
                        status
                    );
                    doc.status = *status;
                }
                FieldOp::SetRunId(run_id) => doc.run_id = *run_id,
                FieldOp::SetAfter(after) => doc.after = *after,
                FieldOp::SetUpdated(updated) => doc.updated = *updated,
                FieldOp::SetProgress(progress) => doc.progress = *progress,
                FieldOp::SetResult(result) => doc.result = Some(result.clone()),
                FieldOp::PushLog(entry) => doc.log.push(entry.clone()),
                FieldOp::ConsumeRetry => {
                    doc.retries = doc.retries.consume();
                    doc.retried += 1;
                }
                FieldOp::RestockRetries(count) => {
                    doc.retries = doc.retries.restock(*count);
                }
                FieldOp::ResolveDependency(id) => {
                    if let Some(pos) = doc.depends.iter().position(|d| d == id) {
                        doc.depends.remove(pos);
                        if !doc.resolved.contains(id) {
                            doc.resolved.push(*id);
                        }
                    }
                }
            }
        }
    }
}

/// Persistent store of job documents.
///
/// Implementations must guarantee that a conditional update (a query naming
/// id + expected status) is atomic per document: the match check and the
/// write happen without interleaving writers. Atomicity across documents is
/// not required.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new document. Fails on duplicate id.
    async fn insert(&self, doc: JobDoc) -> Result<JobId, StoreError>;

    /// Find the first document matching the query.
    async fn find_one(&self, query: &JobQuery) -> Result<Option<JobDoc>, StoreError>;

    /// Find all documents matching the query.
    async fn find(&self, query: &JobQuery, projection: Projection)
        -> Result<Vec<JobDoc>, StoreError>;

    /// Apply the mutation to matching documents. With `multi` false, at most
    /// one document is touched. Returns the number of documents mutated.
    async fn update(
        &self,
        query: &JobQuery,
        mutation: &JobMutation,
        multi: bool,
    ) -> Result<usize, StoreError>;

    /// Atomically apply the mutation to the first matching document and
    /// return its previous state, or `None` when nothing matched. This is
    /// how dispatch learns which job it won.
    async fn find_and_modify(
        &self,
        query: &JobQuery,
        mutation: &JobMutation,
    ) -> Result<Option<JobDoc>, StoreError>;

    /// Remove matching documents, returning the count removed.
    async fn remove(&self, query: &JobQuery) -> Result<usize, StoreError>;
}

/// Elide the log from a document per the projection.
pub(crate) fn project(mut doc: JobDoc, projection: Projection) -> JobDoc {
    if projection == Projection::WithoutLog {
        doc.log.clear();
    }
    doc
}
