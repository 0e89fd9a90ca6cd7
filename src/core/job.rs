//! The job document and its state machine.
//!
//! A job is a single persistent document. All lifecycle mutation flows
//! through the legal-transition graph encoded here; the store enforces it at
//! write time via conditional updates keyed on the expected current status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;

use super::policy::{serde_millis, Budget, RepeatPolicy, RetryPolicy};
use super::types::{JobId, RunId};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting on its `after` time or on unresolved dependencies.
    Waiting,
    /// Held by a manager; never promoted while paused.
    Paused,
    /// Eligible for dispatch to a worker.
    Ready,
    /// Claimed by a worker; `run_id` identifies the attempt.
    Running,
    /// Terminally failed (fatal error or retry budget exhausted).
    Failed,
    /// Cancelled by a manager or a cascade.
    Cancelled,
    /// Finished successfully; `result` is set.
    Completed,
}

impl JobStatus {
    /// All statuses a cancel may act on.
    pub const CANCELLABLE: [JobStatus; 4] = [
        JobStatus::Running,
        JobStatus::Ready,
        JobStatus::Waiting,
        JobStatus::Paused,
    ];

    /// All statuses a restart may act on.
    pub const RESTARTABLE: [JobStatus; 2] = [JobStatus::Cancelled, JobStatus::Failed];

    /// Whether this status is terminal (no further transitions except
    /// restart, and removal is legal).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a cancel may act on a job in this status.
    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }

    /// Whether a restart may act on a job in this status.
    pub fn is_restartable(&self) -> bool {
        Self::RESTARTABLE.contains(self)
    }

    /// Whether the transition `self -> to` is legal.
    ///
    /// Completed jobs never transition; `rerun` clones a fresh sibling
    /// instead of mutating the original.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Waiting, Ready)
                | (Waiting, Paused)
                | (Waiting, Cancelled)
                | (Paused, Waiting)
                | (Paused, Cancelled)
                | (Ready, Running)
                | (Ready, Paused)
                | (Ready, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Waiting)
                | (Running, Cancelled)
                | (Failed, Waiting)
                | (Cancelled, Waiting)
        )
    }

    /// Stable string form used on the wire and in store backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Paused => "paused",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "paused" => Some(JobStatus::Paused),
            "ready" => Some(JobStatus::Ready),
            "running" => Some(JobStatus::Running),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "completed" => Some(JobStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Success,
    Warning,
    Danger,
}

/// One entry in a job's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// When the entry was appended.
    pub time: DateTime<Utc>,
    /// The run the entry belongs to, if any.
    pub run_id: Option<RunId>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(run_id: Option<RunId>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            run_id,
            level,
            message: message.into(),
        }
    }

    /// Info-level entry with no run attribution.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(None, LogLevel::Info, message)
    }
}

/// Completion progress of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: f64,
    pub total: f64,
    pub percent: f64,
}

impl Progress {
    /// Build a progress value, computing the percentage.
    ///
    /// Returns `None` when the pair is out of range (`completed` must lie in
    /// `[0, total]`). A zero `total` yields zero percent rather than a
    /// division error.
    pub fn new(completed: f64, total: f64) -> Option<Self> {
        if !completed.is_finite() || !total.is_finite() || completed < 0.0 || completed > total {
            return None;
        }
        let percent = if total > 0.0 {
            100.0 * completed / total
        } else {
            0.0
        };
        Some(Self {
            completed,
            total,
            percent,
        })
    }

    /// Fresh zero-of-one progress for a new job.
    pub fn zero() -> Self {
        Self {
            completed: 0.0,
            total: 1.0,
            percent: 0.0,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::zero()
    }
}

/// Named priority levels. Lower numeric value dispatches sooner.
pub mod priority {
    pub const LOW: i32 = 10;
    pub const NORMAL: i32 = 0;
    pub const MEDIUM: i32 = -5;
    pub const HIGH: i32 = -10;
    pub const CRITICAL: i32 = -15;

    /// Map a priority name to its numeric value.
    pub fn from_name(name: &str) -> Option<i32> {
        match name {
            "low" => Some(LOW),
            "normal" => Some(NORMAL),
            "medium" => Some(MEDIUM),
            "high" => Some(HIGH),
            "critical" => Some(CRITICAL),
            _ => None,
        }
    }
}

/// A persistent job document.
///
/// Field meanings follow the lifecycle invariants: `run_id` is non-null
/// exactly while `status` is running, `depends` and `resolved` are disjoint,
/// and `log` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDoc {
    /// Unique job identifier.
    pub id: JobId,
    /// Job type, set at creation, immutable.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque creator-supplied payload, immutable.
    pub data: Value,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Current run, present only while running.
    pub run_id: Option<RunId>,
    /// Dispatch priority; lower runs sooner.
    pub priority: i32,
    /// Earliest time the job may become ready.
    pub after: DateTime<Utc>,
    /// Time of the last status-affecting mutation.
    pub updated: DateTime<Utc>,
    /// Antecedent jobs that must complete first.
    pub depends: Vec<JobId>,
    /// Antecedents already satisfied.
    pub resolved: Vec<JobId>,
    /// Remaining retry budget.
    pub retries: Budget,
    /// Retries consumed so far.
    pub retried: u32,
    /// Wait before a retried run becomes eligible.
    #[serde(with = "serde_millis")]
    pub retry_wait: Duration,
    /// Remaining repeat budget.
    pub repeats: Budget,
    /// Repeats performed so far.
    pub repeated: u32,
    /// Wait before a repeat sibling becomes eligible.
    #[serde(with = "serde_millis")]
    pub repeat_wait: Duration,
    /// Completion progress.
    pub progress: Progress,
    /// Append-only log.
    pub log: Vec<LogEntry>,
    /// Result payload, present only once completed.
    pub result: Option<Value>,
}

impl JobDoc {
    /// Create a new job of the given type, eligible immediately, with
    /// default policies and normal priority.
    pub fn new(job_type: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            data,
            status: JobStatus::Waiting,
            run_id: None,
            priority: priority::NORMAL,
            after: now,
            updated: now,
            depends: Vec::new(),
            resolved: Vec::new(),
            retries: Budget::none(),
            retried: 0,
            retry_wait: RetryPolicy::default().wait,
            repeats: Budget::none(),
            repeated: 0,
            repeat_wait: RepeatPolicy::default().wait,
            progress: Progress::zero(),
            log: Vec::new(),
            result: None,
        }
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the earliest eligibility time.
    pub fn with_after(mut self, after: DateTime<Utc>) -> Self {
        self.after = after;
        self
    }

    /// Delay eligibility by a duration from now.
    pub fn with_delay(self, delay: Duration) -> Self {
        let after = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.with_after(after)
    }

    /// Set the antecedent jobs this job depends on.
    pub fn with_depends(mut self, depends: Vec<JobId>) -> Self {
        self.depends = depends;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retries = policy.retries;
        self.retry_wait = policy.wait;
        self
    }

    /// Set the repeat policy.
    pub fn with_repeat(mut self, policy: RepeatPolicy) -> Self {
        self.repeats = policy.repeats;
        self.repeat_wait = policy.wait;
        self
    }

    /// Create the job paused instead of waiting.
    pub fn paused(mut self) -> Self {
        self.status = JobStatus::Paused;
        self
    }

    /// Clone this completed job into a fresh waiting sibling.
    ///
    /// Counters carry the repeat lineage (`repeated + 1`, repeat budget
    /// consumed); the retry budget is restored to its original size and the
    /// run state, progress, log, and dependency lists start fresh.
    pub fn repeat_sibling(&self, now: DateTime<Utc>) -> Self {
        let mut sibling = JobDoc::new(self.job_type.clone(), self.data.clone());
        sibling.priority = self.priority;
        sibling.retries = self.retries.restock(self.retried);
        sibling.retry_wait = self.retry_wait;
        sibling.repeats = self.repeats.consume();
        sibling.repeated = self.repeated + 1;
        sibling.repeat_wait = self.repeat_wait;
        sibling.after = now
            .checked_add_signed(
                chrono::Duration::from_std(self.repeat_wait).unwrap_or(chrono::TimeDelta::MAX),
            )
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        sibling.updated = now;
        sibling
    }

    /// Ordering used by dispatch: priority ascending, then `after`
    /// ascending, then `updated` ascending.
    pub fn dispatch_order(&self, other: &JobDoc) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.after.cmp(&other.after))
            .then(self.updated.cmp(&other.updated))
    }

    /// Whether the job is eligible for promotion at `now`.
    pub fn promotable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.after <= now && self.depends.is_empty()
    }
}
