//! Dynamic method dispatch.
//!
//! Remote calls arrive as a method name plus a JSON params object. The
//! registry resolves the name (optionally qualified by the collection, so
//! several servers can share one transport), evaluates the permission gate,
//! journals the call, and hands typed parameters to the method body.
//! Server-originated calls pass `None` for the caller and bypass gate and
//! journal entirely.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::methods::{
    CancelOptions, FailOptions, GetJobOptions, GetWorkOptions, LogOptions, RerunOptions,
    RestartOptions, SaveOptions, StopJobsOptions,
};
use super::{JobServer, ServerError};
use crate::access::Scope;
use crate::core::job::{priority, JobDoc};
use crate::core::policy::{Budget, RepeatPolicy, RetryPolicy};
use crate::core::types::{CallerId, JobId, RunId};

/// The remote methods, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodName {
    StartJobs,
    StopJobs,
    JobSave,
    JobRerun,
    GetJob,
    GetWork,
    JobProgress,
    JobLog,
    JobDone,
    JobFail,
    JobPause,
    JobResume,
    JobCancel,
    JobRestart,
    JobRemove,
}

impl MethodName {
    /// Parse a bare (unqualified) wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "startJobs" => Some(Self::StartJobs),
            "stopJobs" => Some(Self::StopJobs),
            "jobSave" => Some(Self::JobSave),
            "jobRerun" => Some(Self::JobRerun),
            "getJob" => Some(Self::GetJob),
            "getWork" => Some(Self::GetWork),
            "jobProgress" => Some(Self::JobProgress),
            "jobLog" => Some(Self::JobLog),
            "jobDone" => Some(Self::JobDone),
            "jobFail" => Some(Self::JobFail),
            "jobPause" => Some(Self::JobPause),
            "jobResume" => Some(Self::JobResume),
            "jobCancel" => Some(Self::JobCancel),
            "jobRestart" => Some(Self::JobRestart),
            "jobRemove" => Some(Self::JobRemove),
            _ => None,
        }
    }

    /// The bare wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartJobs => "startJobs",
            Self::StopJobs => "stopJobs",
            Self::JobSave => "jobSave",
            Self::JobRerun => "jobRerun",
            Self::GetJob => "getJob",
            Self::GetWork => "getWork",
            Self::JobProgress => "jobProgress",
            Self::JobLog => "jobLog",
            Self::JobDone => "jobDone",
            Self::JobFail => "jobFail",
            Self::JobPause => "jobPause",
            Self::JobResume => "jobResume",
            Self::JobCancel => "jobCancel",
            Self::JobRestart => "jobRestart",
            Self::JobRemove => "jobRemove",
        }
    }

    /// The scope set the gate evaluates: the method's roles plus its name.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes = match self {
            Self::StartJobs | Self::StopJobs => vec![Scope::Admin],
            Self::JobSave | Self::JobRerun => vec![Scope::Admin, Scope::Creator],
            Self::GetJob
            | Self::GetWork
            | Self::JobProgress
            | Self::JobLog
            | Self::JobDone
            | Self::JobFail => vec![Scope::Admin, Scope::Worker],
            Self::JobPause
            | Self::JobResume
            | Self::JobCancel
            | Self::JobRestart
            | Self::JobRemove => vec![Scope::Admin, Scope::Manager],
        };
        scopes.push(Scope::method(self.as_str()));
        scopes
    }
}

impl std::fmt::Display for MethodName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One id or a list of ids; single-id calls get single-doc replies.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn is_one(&self) -> bool {
        matches!(self, Self::One(_))
    }

    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// A priority on the wire: numeric, or one of the level names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PriorityArg {
    Level(i32),
    Named(String),
}

/// A budget on the wire: a count, or the string "forever".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BudgetArg {
    Count(u32),
    Named(String),
}

impl BudgetArg {
    fn into_budget(self) -> Result<Budget, ServerError> {
        match self {
            Self::Count(count) => Ok(Budget::count(count)),
            Self::Named(name) if name == "forever" => Ok(Budget::FOREVER),
            Self::Named(name) => Err(ServerError::InvalidArgument(format!(
                "unknown budget: {}",
                name
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrySpec {
    retries: Option<BudgetArg>,
    wait: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepeatSpec {
    repeats: Option<BudgetArg>,
    wait: Option<u64>,
}

/// Wire shape of a job to save.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    data: Value,
    priority: Option<PriorityArg>,
    after: Option<DateTime<Utc>>,
    /// Delay from now in milliseconds; takes precedence over `after`.
    delay: Option<u64>,
    #[serde(default)]
    depends: Vec<JobId>,
    retry: Option<RetrySpec>,
    repeat: Option<RepeatSpec>,
    #[serde(default)]
    paused: bool,
}

impl JobSpec {
    fn into_doc(self) -> Result<JobDoc, ServerError> {
        let mut doc = JobDoc::new(self.job_type, self.data).with_depends(self.depends);

        if let Some(arg) = self.priority {
            let value = match arg {
                PriorityArg::Level(level) => level,
                PriorityArg::Named(name) => priority::from_name(&name).ok_or_else(|| {
                    ServerError::InvalidArgument(format!("unknown priority: {}", name))
                })?,
            };
            doc = doc.with_priority(value);
        }

        if let Some(millis) = self.delay {
            doc = doc.with_delay(std::time::Duration::from_millis(millis));
        } else if let Some(after) = self.after {
            doc = doc.with_after(after);
        }

        if let Some(retry) = self.retry {
            let defaults = RetryPolicy::default();
            doc = doc.with_retry(RetryPolicy {
                retries: retry
                    .retries
                    .map(BudgetArg::into_budget)
                    .transpose()?
                    .unwrap_or(Budget::FOREVER),
                wait: retry
                    .wait
                    .map(std::time::Duration::from_millis)
                    .unwrap_or(defaults.wait),
            });
        }

        if let Some(repeat) = self.repeat {
            let defaults = RepeatPolicy::default();
            doc = doc.with_repeat(RepeatPolicy {
                repeats: repeat
                    .repeats
                    .map(BudgetArg::into_budget)
                    .transpose()?
                    .unwrap_or(Budget::FOREVER),
                wait: repeat
                    .wait
                    .map(std::time::Duration::from_millis)
                    .unwrap_or(defaults.wait),
            });
        }

        if self.paused {
            doc = doc.paused();
        }
        Ok(doc)
    }
}

#[derive(Debug, Deserialize)]
struct JobSaveParams {
    doc: JobSpec,
    #[serde(default)]
    options: SaveOptions,
}

#[derive(Debug, Deserialize)]
struct JobRerunParams {
    id: JobId,
    #[serde(default)]
    options: RerunOptions,
}

#[derive(Debug, Deserialize)]
struct GetJobParams {
    ids: OneOrMany<JobId>,
    #[serde(default)]
    options: GetJobOptions,
}

#[derive(Debug, Deserialize)]
struct GetWorkParams {
    types: OneOrMany<String>,
    #[serde(default)]
    options: GetWorkOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobProgressParams {
    id: JobId,
    run_id: RunId,
    completed: f64,
    total: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobLogParams {
    id: JobId,
    run_id: RunId,
    message: String,
    #[serde(default)]
    options: LogOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDoneParams {
    id: JobId,
    run_id: RunId,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobFailParams {
    id: JobId,
    run_id: RunId,
    #[serde(default)]
    err: Value,
    #[serde(default)]
    options: FailOptions,
}

#[derive(Debug, Deserialize)]
struct IdsParams {
    ids: OneOrMany<JobId>,
}

#[derive(Debug, Deserialize)]
struct JobCancelParams {
    ids: OneOrMany<JobId>,
    #[serde(default)]
    options: CancelOptions,
}

#[derive(Debug, Deserialize)]
struct JobRestartParams {
    ids: OneOrMany<JobId>,
    #[serde(default)]
    options: RestartOptions,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ServerError> {
    serde_json::from_value(params).map_err(|e| ServerError::InvalidArgument(e.to_string()))
}

impl JobServer {
    /// Dispatch a method by wire name.
    ///
    /// `caller` is `None` for server-originated calls, which bypass the
    /// permission gate and the call journal. The method name may be
    /// qualified as `<collection>.<method>`; a qualification for another
    /// collection is an unknown method here.
    pub async fn dispatch(
        &self,
        caller: Option<&CallerId>,
        method: &str,
        params: Value,
    ) -> Result<Value, ServerError> {
        let bare = match method.split_once('.') {
            Some((collection, bare)) if collection == self.collection() => bare,
            Some(_) => return Err(ServerError::UnknownMethod(method.to_string())),
            None => method,
        };
        let name = MethodName::parse(bare)
            .ok_or_else(|| ServerError::UnknownMethod(method.to_string()))?;

        if let Some(caller) = caller {
            self.journal(&format!(
                "{}, {}, {}, params: {}",
                Utc::now().to_rfc3339(),
                caller,
                method,
                params
            ));
            if !self.gate().authorize(caller, bare, &name.scopes(), &params) {
                self.journal("UNAUTHORIZED.");
                tracing::warn!(caller = %caller, method = %method, "Call rejected by gate");
                return Err(ServerError::Unauthorized);
            }
        }

        let result = self.invoke(name, params).await?;
        if caller.is_some() {
            self.journal(&format!("    returned: {}", result));
        }
        Ok(result)
    }

    async fn invoke(&self, name: MethodName, params: Value) -> Result<Value, ServerError> {
        match name {
            MethodName::StartJobs => Ok(json!(self.start_jobs().await?)),
            MethodName::StopJobs => {
                let options: StopJobsOptions = parse_params(params)?;
                Ok(json!(self.stop_jobs(options).await?))
            }
            MethodName::JobSave => {
                let p: JobSaveParams = parse_params(params)?;
                let id = self.job_save(p.doc.into_doc()?, p.options).await?;
                Ok(json!(id))
            }
            MethodName::JobRerun => {
                let p: JobRerunParams = parse_params(params)?;
                Ok(json!(self.job_rerun(p.id, p.options).await?))
            }
            MethodName::GetJob => {
                let p: GetJobParams = parse_params(params)?;
                let single = p.ids.is_one();
                let docs = self.get_job(&p.ids.into_vec(), p.options).await?;
                if single {
                    Ok(json!(docs.into_iter().next()))
                } else {
                    Ok(json!(docs))
                }
            }
            MethodName::GetWork => {
                let p: GetWorkParams = parse_params(params)?;
                Ok(json!(self.get_work(&p.types.into_vec(), p.options).await?))
            }
            MethodName::JobProgress => {
                let p: JobProgressParams = parse_params(params)?;
                Ok(json!(
                    self.job_progress(p.id, p.run_id, p.completed, p.total).await?
                ))
            }
            MethodName::JobLog => {
                let p: JobLogParams = parse_params(params)?;
                Ok(json!(
                    self.job_log(p.id, p.run_id, &p.message, p.options).await?
                ))
            }
            MethodName::JobDone => {
                let p: JobDoneParams = parse_params(params)?;
                Ok(json!(self.job_done(p.id, p.run_id, p.result).await?))
            }
            MethodName::JobFail => {
                let p: JobFailParams = parse_params(params)?;
                Ok(json!(
                    self.job_fail(p.id, p.run_id, p.err, p.options).await?
                ))
            }
            MethodName::JobPause => {
                let p: IdsParams = parse_params(params)?;
                Ok(json!(self.job_pause(&p.ids.into_vec()).await?))
            }
            MethodName::JobResume => {
                let p: IdsParams = parse_params(params)?;
                Ok(json!(self.job_resume(&p.ids.into_vec()).await?))
            }
            MethodName::JobCancel => {
                let p: JobCancelParams = parse_params(params)?;
                Ok(json!(self.job_cancel(&p.ids.into_vec(), p.options).await?))
            }
            MethodName::JobRestart => {
                let p: JobRestartParams = parse_params(params)?;
                Ok(json!(self.job_restart(&p.ids.into_vec(), p.options).await?))
            }
            MethodName::JobRemove => {
                let p: IdsParams = parse_params(params)?;
                Ok(json!(self.job_remove(&p.ids.into_vec()).await?))
            }
        }
    }
}
