//! Job method semantics.
//!
//! Every mutating method here is built the same way: a conditional query
//! naming the job id and its expected current status (plus the run id for
//! running-state operations), and a mutation that performs the transition,
//! appends its log entry, and refreshes `updated` in one atomic store
//! update. A query that no longer matches means another caller won a race;
//! the miss surfaces as `false`, never as a silent retry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use super::{JobServer, ServerError};
use crate::config::CancelRepeatsMatch;
use crate::config::StaleRunReply;
use crate::core::job::{JobDoc, JobStatus, LogEntry, LogLevel, Progress};
use crate::core::policy::Budget;
use crate::core::types::{JobId, RunId};
use crate::store::{JobMutation, JobQuery, JobStore, Projection};

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

/// Options for `stopJobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopJobsOptions {
    /// Drain window before running jobs are force-failed. Falls back to the
    /// server's configured stop timeout.
    #[serde(with = "serde_opt_millis")]
    pub timeout: Option<Duration>,
}

/// Options for `jobSave`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveOptions {
    /// Cancel existing forever-repeating jobs of the same type first.
    pub cancel_repeats: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            cancel_repeats: true,
        }
    }
}

/// Options for `jobRerun`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RerunOptions {
    /// Repeat budget for the new sibling.
    pub repeats: Option<Budget>,
    /// Eligibility delay for the new sibling; defaults to the original's
    /// repeat wait.
    #[serde(with = "serde_opt_millis")]
    pub wait: Option<Duration>,
}

/// Options for `getJob`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetJobOptions {
    /// Include the log in returned documents.
    pub get_log: bool,
}

/// Options for `getWork`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetWorkOptions {
    /// Maximum jobs handed out in one call.
    #[serde(default = "default_one")]
    pub max_jobs: usize,
}

impl Default for GetWorkOptions {
    fn default() -> Self {
        Self { max_jobs: 1 }
    }
}

/// Options for `jobLog`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogOptions {
    /// Severity of the entry.
    pub level: LogLevel,
}

/// Options for `jobFail`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailOptions {
    /// Fail terminally even when retries remain.
    pub fatal: bool,
}

/// Options for `jobCancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelOptions {
    /// Also cancel jobs these jobs depend on, transitively.
    pub antecedents: bool,
    /// Also cancel jobs depending on these jobs, transitively.
    #[serde(default = "default_true")]
    pub dependents: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            antecedents: false,
            dependents: true,
        }
    }
}

/// Options for `jobRestart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartOptions {
    /// Also restart failed/cancelled antecedents, transitively.
    #[serde(default = "default_true")]
    pub antecedents: bool,
    /// Also restart failed/cancelled dependents, transitively.
    pub dependents: bool,
    /// Retries restocked onto each restarted job.
    pub retries: u32,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            antecedents: true,
            dependents: false,
            retries: 1,
        }
    }
}

/// Serde helper for optional Duration as integer milliseconds.
mod serde_opt_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl JobServer {
    /// Save a new job document, returning its id.
    ///
    /// Validates the document, rejects saves whose dependencies are unknown
    /// or would close a cycle, and (for forever-repeating jobs with
    /// `cancelRepeats`) first cancels existing forever-repeating jobs of the
    /// same type.
    pub async fn job_save(&self, doc: JobDoc, options: SaveOptions) -> Result<JobId, ServerError> {
        if doc.job_type.is_empty() {
            return Err(ServerError::InvalidArgument(
                "job type must not be empty".into(),
            ));
        }
        if !matches!(doc.status, JobStatus::Waiting | JobStatus::Paused) {
            return Err(ServerError::InvalidArgument(format!(
                "a job may only be saved as waiting or paused, not {}",
                doc.status
            )));
        }
        if self
            .store()
            .find_one(&JobQuery::by_id(doc.id))
            .await?
            .is_some()
        {
            return Err(ServerError::InvalidArgument(format!(
                "job id already exists: {}",
                doc.id
            )));
        }

        if !doc.depends.is_empty() {
            let mut unique = HashSet::new();
            for dep in &doc.depends {
                if !unique.insert(*dep) {
                    return Err(ServerError::InvalidArgument(format!(
                        "duplicate dependency: {}",
                        dep
                    )));
                }
            }
            if self.would_close_cycle(doc.id, &doc.depends).await? {
                return Err(ServerError::InvalidArgument(
                    "dependencies would close a cycle".into(),
                ));
            }
            let found = self
                .store()
                .find(
                    &JobQuery::by_ids(doc.depends.clone()),
                    Projection::WithoutLog,
                )
                .await?;
            if found.len() != doc.depends.len() {
                let known: HashSet<JobId> = found.iter().map(|d| d.id).collect();
                let missing = doc
                    .depends
                    .iter()
                    .find(|d| !known.contains(d))
                    .copied()
                    .unwrap_or(doc.id);
                return Err(ServerError::InvalidArgument(format!(
                    "unknown dependency: {}",
                    missing
                )));
            }
        }

        if options.cancel_repeats && doc.repeats.is_forever() {
            self.cancel_existing_repeats(&doc).await?;
        }

        let now = Utc::now();
        let mut doc = doc;
        doc.run_id = None;
        doc.result = None;
        doc.resolved.clear();
        doc.progress = Progress::zero();
        doc.updated = now;
        doc.log
            .push(LogEntry::new(None, LogLevel::Info, "Job submitted"));

        let id = self.store().insert(doc).await?;
        tracing::info!(job_id = %id, "Job saved");
        Ok(id)
    }

    /// Clone a completed job into a fresh waiting sibling.
    ///
    /// Returns the new id, or `None` when the job is missing or not
    /// completed.
    pub async fn job_rerun(
        &self,
        id: JobId,
        options: RerunOptions,
    ) -> Result<Option<JobId>, ServerError> {
        let query = JobQuery::by_id(id).with_status(JobStatus::Completed);
        let Some(original) = self.store().find_one(&query).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let wait = options.wait.unwrap_or(original.repeat_wait);
        let mut sibling = original.repeat_sibling(now);
        sibling.repeats = options.repeats.unwrap_or(Budget::none());
        sibling.repeated = 0;
        sibling.repeat_wait = wait;
        sibling.after = now + chrono::Duration::from_std(wait).unwrap_or_default();
        sibling
            .log
            .push(LogEntry::new(None, LogLevel::Info, "Job submitted"));

        let new_id = self.store().insert(sibling).await?;
        tracing::info!(job_id = %id, new_job_id = %new_id, "Job rerun");
        Ok(Some(new_id))
    }

    /// Fetch jobs by id.
    pub async fn get_job(
        &self,
        ids: &[JobId],
        options: GetJobOptions,
    ) -> Result<Vec<JobDoc>, ServerError> {
        let projection = if options.get_log {
            Projection::Full
        } else {
            Projection::WithoutLog
        };
        Ok(self
            .store()
            .find(&JobQuery::by_ids(ids.to_vec()), projection)
            .await?)
    }

    /// Hand ready jobs of the requested types to a worker.
    ///
    /// Candidates are taken in dispatch order (priority, then `after`, then
    /// `updated`); each is claimed with an atomic ready -> running update
    /// that mints a fresh run id. Candidates lost to a concurrent claim are
    /// skipped. Returns empty while job flow is stopped; never blocks.
    pub async fn get_work(
        &self,
        types: &[String],
        options: GetWorkOptions,
    ) -> Result<Vec<JobDoc>, ServerError> {
        if options.max_jobs == 0 || self.is_stopped().await {
            return Ok(Vec::new());
        }

        let mut candidates = self
            .store()
            .find(
                &JobQuery::default()
                    .with_status(JobStatus::Ready)
                    .with_types(types.to_vec()),
                Projection::WithoutLog,
            )
            .await?;
        candidates.sort_by(|a, b| a.dispatch_order(b));

        let mut claimed = Vec::new();
        for candidate in candidates {
            if claimed.len() == options.max_jobs {
                break;
            }
            let now = Utc::now();
            let run_id = RunId::new();
            let mutation = JobMutation::new()
                .set_status(JobStatus::Running)
                .set_run_id(Some(run_id))
                .set_updated(now)
                .push_log(LogEntry::new(Some(run_id), LogLevel::Info, "Running"));
            let query = JobQuery::by_id(candidate.id).with_status(JobStatus::Ready);

            // a raced candidate comes back None and is skipped
            if let Some(previous) = self.store().find_and_modify(&query, &mutation).await? {
                let mut doc = previous;
                mutation.apply(&mut doc);
                doc.log.clear();
                tracing::debug!(job_id = %doc.id, run_id = %run_id, "Dispatched");
                claimed.push(doc);
            }
        }
        Ok(claimed)
    }

    /// Record progress for a running job.
    ///
    /// Returns `None` while job flow is stopped (workers should go quiet).
    /// A report against a superseded run returns `false` or `None` per the
    /// server's stale-run configuration.
    pub async fn job_progress(
        &self,
        id: JobId,
        run_id: RunId,
        completed: f64,
        total: f64,
    ) -> Result<Option<bool>, ServerError> {
        if self.is_stopped().await {
            return Ok(None);
        }
        let progress = Progress::new(completed, total).ok_or_else(|| {
            ServerError::InvalidArgument(format!(
                "progress out of range: {} of {}",
                completed, total
            ))
        })?;

        let query = JobQuery::by_id(id)
            .with_status(JobStatus::Running)
            .with_run_id(run_id);
        let mutation = JobMutation::new()
            .set_progress(progress)
            .set_updated(Utc::now());

        let count = self.store().update(&query, &mutation, false).await?;
        if count == 1 {
            Ok(Some(true))
        } else {
            match self.config().stale_run_reply {
                StaleRunReply::Rejected => Ok(Some(false)),
                StaleRunReply::Stopped => Ok(None),
            }
        }
    }

    /// Append a worker log entry to a running job.
    pub async fn job_log(
        &self,
        id: JobId,
        run_id: RunId,
        message: &str,
        options: LogOptions,
    ) -> Result<bool, ServerError> {
        let query = JobQuery::by_id(id)
            .with_status(JobStatus::Running)
            .with_run_id(run_id);
        let mutation = JobMutation::new()
            .push_log(LogEntry::new(Some(run_id), options.level, message))
            .set_updated(Utc::now());
        Ok(self.store().update(&query, &mutation, false).await? == 1)
    }

    /// Complete a running job, then resolve dependents and spawn the repeat
    /// sibling if the repeat budget allows.
    pub async fn job_done(
        &self,
        id: JobId,
        run_id: RunId,
        result: Value,
    ) -> Result<bool, ServerError> {
        let now = Utc::now();
        let query = JobQuery::by_id(id)
            .with_status(JobStatus::Running)
            .with_run_id(run_id);
        let mutation = JobMutation::new()
            .set_status(JobStatus::Completed)
            .set_run_id(None)
            .set_result(result)
            .set_updated(now)
            .push_log(LogEntry::new(Some(run_id), LogLevel::Success, "Job completed"));

        let Some(previous) = self.store().find_and_modify(&query, &mutation).await? else {
            return Ok(false);
        };
        tracing::info!(job_id = %id, run_id = %run_id, "Job completed");

        // dependency cascade: move this id from depends to resolved in every
        // dependent; duplicate application is a no-op
        let resolved = self
            .store()
            .update(
                &JobQuery::default().depending_on(id),
                &JobMutation::new()
                    .resolve_dependency(id)
                    .set_updated(now)
                    .push_log(LogEntry::new(
                        None,
                        LogLevel::Info,
                        format!("Dependency resolved: {}", id),
                    )),
                true,
            )
            .await?;
        if resolved > 0 {
            tracing::debug!(job_id = %id, dependents = resolved, "Resolved dependents");
        }

        if previous.repeats.available() {
            let mut sibling = previous.repeat_sibling(now);
            sibling
                .log
                .push(LogEntry::new(None, LogLevel::Info, "Job submitted"));
            let sibling_id = self.store().insert(sibling).await?;
            tracing::info!(job_id = %id, sibling_id = %sibling_id, "Spawned repeat sibling");
        }

        Ok(true)
    }

    /// Fail a running job: re-queue it when retries remain and the failure
    /// is not fatal, fail it terminally otherwise.
    pub async fn job_fail(
        &self,
        id: JobId,
        run_id: RunId,
        err: Value,
        options: FailOptions,
    ) -> Result<bool, ServerError> {
        let query = JobQuery::by_id(id)
            .with_status(JobStatus::Running)
            .with_run_id(run_id);
        let Some(doc) = self.store().find_one(&query).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let reason = match &err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let entry = LogEntry::new(
            Some(run_id),
            LogLevel::Danger,
            format!("Job failed: {}", reason),
        );

        let retrying = !options.fatal && doc.retries.available();
        let mutation = if retrying {
            let after = now + chrono::Duration::from_std(doc.retry_wait).unwrap_or_default();
            JobMutation::new()
                .set_status(JobStatus::Waiting)
                .set_run_id(None)
                .set_after(after)
                .consume_retry()
                .set_updated(now)
                .push_log(entry)
        } else {
            JobMutation::new()
                .set_status(JobStatus::Failed)
                .set_run_id(None)
                .set_updated(now)
                .push_log(entry)
        };

        // the same precondition travels with the write; a raced change misses
        let count = self.store().update(&query, &mutation, false).await?;
        if count == 0 {
            return Ok(false);
        }
        if retrying {
            tracing::info!(job_id = %id, run_id = %run_id, "Job failed, re-queued for retry");
        } else {
            tracing::warn!(job_id = %id, run_id = %run_id, "Job failed terminally");
        }
        Ok(true)
    }

    /// Pause waiting or ready jobs.
    pub async fn job_pause(&self, ids: &[JobId]) -> Result<bool, ServerError> {
        let now = Utc::now();
        for id in ids {
            let query = JobQuery::by_id(*id)
                .with_statuses(&[JobStatus::Waiting, JobStatus::Ready]);
            let mutation = JobMutation::new()
                .set_status(JobStatus::Paused)
                .set_updated(now)
                .push_log(LogEntry::new(None, LogLevel::Info, "Job paused"));
            self.store().update(&query, &mutation, false).await?;
        }
        self.all_in_status(ids, &[JobStatus::Paused]).await
    }

    /// Resume paused jobs into waiting.
    pub async fn job_resume(&self, ids: &[JobId]) -> Result<bool, ServerError> {
        let now = Utc::now();
        for id in ids {
            let query = JobQuery::by_id(*id).with_status(JobStatus::Paused);
            let mutation = JobMutation::new()
                .set_status(JobStatus::Waiting)
                .set_updated(now)
                .push_log(LogEntry::new(None, LogLevel::Info, "Job resumed"));
            self.store().update(&query, &mutation, false).await?;
        }
        self.all_in_status(ids, &[JobStatus::Waiting]).await
    }

    /// Cancel jobs, cascading across the dependency graph per the options.
    pub async fn job_cancel(
        &self,
        ids: &[JobId],
        options: CancelOptions,
    ) -> Result<bool, ServerError> {
        let affected = self
            .cascade_closure(ids, options.antecedents, options.dependents)
            .await?;

        let now = Utc::now();
        for id in &affected {
            let query =
                JobQuery::by_id(*id).with_statuses(&JobStatus::CANCELLABLE);
            let mutation = JobMutation::new()
                .set_status(JobStatus::Cancelled)
                .set_run_id(None)
                .set_updated(now)
                .push_log(LogEntry::new(None, LogLevel::Warning, "Job cancelled"));
            if self.store().update(&query, &mutation, false).await? == 1 {
                tracing::info!(job_id = %id, "Job cancelled");
            }
        }
        self.all_in_status(ids, &[JobStatus::Cancelled]).await
    }

    /// Restart failed or cancelled jobs, cascading across the dependency
    /// graph per the options.
    pub async fn job_restart(
        &self,
        ids: &[JobId],
        options: RestartOptions,
    ) -> Result<bool, ServerError> {
        let affected = self
            .cascade_closure(ids, options.antecedents, options.dependents)
            .await?;

        let now = Utc::now();
        for id in &affected {
            let query =
                JobQuery::by_id(*id).with_statuses(&JobStatus::RESTARTABLE);
            let mutation = JobMutation::new()
                .set_status(JobStatus::Waiting)
                .restock_retries(options.retries)
                .set_updated(now)
                .push_log(LogEntry::new(None, LogLevel::Info, "Job restarted"));
            if self.store().update(&query, &mutation, false).await? == 1 {
                tracing::info!(job_id = %id, "Job restarted");
            }
        }
        self.all_in_status(ids, &[JobStatus::Waiting]).await
    }

    /// Remove jobs. Legal only in a terminal state.
    pub async fn job_remove(&self, ids: &[JobId]) -> Result<bool, ServerError> {
        let query = JobQuery::by_ids(ids.to_vec()).with_statuses(&[
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]);
        let removed = self.store().remove(&query).await?;
        if removed > 0 {
            tracing::info!(count = removed, "Removed jobs");
        }
        Ok(removed == ids.len())
    }

    /// True iff every listed job exists and sits in one of the statuses.
    async fn all_in_status(
        &self,
        ids: &[JobId],
        statuses: &[JobStatus],
    ) -> Result<bool, ServerError> {
        let docs = self
            .store()
            .find(&JobQuery::by_ids(ids.to_vec()), Projection::WithoutLog)
            .await?;
        Ok(docs.len() == ids.len() && docs.iter().all(|d| statuses.contains(&d.status)))
    }

    /// Transitive closure over the depends graph in the requested
    /// direction(s), starting from `roots` (which are always included).
    async fn cascade_closure(
        &self,
        roots: &[JobId],
        antecedents: bool,
        dependents: bool,
    ) -> Result<Vec<JobId>, ServerError> {
        let mut seen: HashSet<JobId> = roots.iter().copied().collect();
        let mut frontier: Vec<JobId> = roots.to_vec();

        while let Some(id) = frontier.pop() {
            if antecedents {
                if let Some(doc) = self.store().find_one(&JobQuery::by_id(id)).await? {
                    for dep in doc.depends.iter().chain(doc.resolved.iter()) {
                        if seen.insert(*dep) {
                            frontier.push(*dep);
                        }
                    }
                }
            }
            if dependents {
                let deps = self
                    .store()
                    .find(
                        &JobQuery::default().depending_on(id),
                        Projection::WithoutLog,
                    )
                    .await?;
                for doc in deps {
                    if seen.insert(doc.id) {
                        frontier.push(doc.id);
                    }
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Reverse reachability: would `depends` reach back to `new_id` through
    /// the saved graph?
    async fn would_close_cycle(
        &self,
        new_id: JobId,
        depends: &[JobId],
    ) -> Result<bool, ServerError> {
        let mut seen: HashSet<JobId> = depends.iter().copied().collect();
        let mut frontier: Vec<JobId> = depends.to_vec();

        while let Some(id) = frontier.pop() {
            if id == new_id {
                return Ok(true);
            }
            if let Some(doc) = self.store().find_one(&JobQuery::by_id(id)).await? {
                for dep in doc.depends.iter().chain(doc.resolved.iter()) {
                    if seen.insert(*dep) {
                        frontier.push(*dep);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Cancel cancellable forever-repeating jobs matching the incoming
    /// save, per the configured match scope.
    async fn cancel_existing_repeats(&self, doc: &JobDoc) -> Result<(), ServerError> {
        let mut query = JobQuery::default()
            .with_statuses(&JobStatus::CANCELLABLE)
            .with_types(vec![doc.job_type.clone()])
            .repeating_forever();
        if self.config().cancel_repeats_match == CancelRepeatsMatch::TypeAndData {
            query = query.with_data(doc.data.clone());
        }

        let existing = self.store().find(&query, Projection::WithoutLog).await?;
        if existing.is_empty() {
            return Ok(());
        }
        let ids: Vec<JobId> = existing.iter().map(|d| d.id).collect();
        tracing::info!(
            job_type = %doc.job_type,
            count = ids.len(),
            "Cancelling repeating jobs superseded by save"
        );
        self.job_cancel(
            &ids,
            CancelOptions {
                antecedents: false,
                dependents: true,
            },
        )
        .await?;
        Ok(())
    }
}

/// Force-fail every running job, appending `reason` to each log. Used by the
/// shutdown drain and the startup recovery sweep.
pub(crate) async fn force_fail_running(
    store: &dyn JobStore,
    reason: &str,
) -> Result<usize, ServerError> {
    let now = Utc::now();
    let query = JobQuery::default().with_status(JobStatus::Running);
    let mutation = JobMutation::new()
        .set_status(JobStatus::Failed)
        .set_run_id(None)
        .set_updated(now)
        .push_log(LogEntry::new(None, LogLevel::Danger, reason));
    Ok(store.update(&query, &mutation, true).await?)
}
