//! Configuration types for the server, store, API, and worker queue.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ConfigError;
use crate::core::policy::serde_millis;

/// Reply sent to a worker reporting progress against a superseded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StaleRunReply {
    /// Reply `false`: the write lost, like any other raced precondition.
    #[default]
    Rejected,
    /// Reply `null`: tell the worker to go quiet, as during shutdown.
    Stopped,
}

/// Which jobs `cancelRepeats` matches when saving an infinitely repeating
/// job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancelRepeatsMatch {
    /// Any forever-repeating job of the same type.
    #[default]
    TypeOnly,
    /// Only forever-repeating jobs of the same type carrying the same data.
    TypeAndData,
}

/// Server-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Collection name; prefixes every method on the wire.
    pub collection: String,

    /// Period of the promotion loop.
    #[serde(with = "serde_millis")]
    pub promote_interval: Duration,

    /// Start with job flow stopped; an explicit `startJobs` is required.
    pub start_stopped: bool,

    /// Default drain timeout for `stopJobs` when the caller gives none.
    #[serde(with = "serde_millis")]
    pub stop_timeout: Duration,

    /// Reply for progress reports against a superseded run.
    pub stale_run_reply: StaleRunReply,

    /// Match scope for `cancelRepeats`.
    pub cancel_repeats_match: CancelRepeatsMatch,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            collection: "jobs".to_string(),
            promote_interval: Duration::from_millis(15_000),
            start_stopped: false,
            stop_timeout: Duration::from_secs(60),
            stale_run_reply: StaleRunReply::default(),
            cancel_repeats_match: CancelRepeatsMatch::default(),
        }
    }
}

impl ServerConfig {
    /// Validate field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_empty() {
            return Err(ConfigError::Invalid("collection must not be empty".into()));
        }
        if self.collection.contains('.') {
            return Err(ConfigError::Invalid(
                "collection must not contain '.' (it is the method separator)".into(),
            ));
        }
        if self.promote_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "promote_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Which store backend to use.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoreConfig {
    /// In-memory store; contents are lost on restart.
    #[default]
    Memory,
    /// SQLite store at the given path (requires the `sqlite` feature).
    Sqlite { path: String },
}

/// Configuration for the HTTP facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8566,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Worker-side queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Job types this queue accepts.
    pub types: Vec<String>,

    /// Maximum simultaneous worker invocations.
    pub concurrency: usize,

    /// Jobs packaged per invocation.
    pub cargo: usize,

    /// Interval between getWork calls while below capacity.
    #[serde(with = "serde_millis")]
    pub poll_interval: Duration,

    /// Extra jobs requested beyond capacity to hide fetch latency.
    pub prefetch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            concurrency: 1,
            cargo: 1,
            poll_interval: Duration::from_millis(5_000),
            prefetch: 0,
        }
    }
}

impl QueueConfig {
    /// Queue for a single job type with defaults.
    pub fn for_type(job_type: impl Into<String>) -> Self {
        Self {
            types: vec![job_type.into()],
            ..Self::default()
        }
    }

    /// Total jobs the queue will hold: `concurrency * cargo + prefetch`.
    pub fn capacity(&self) -> usize {
        self.concurrency * self.cargo + self.prefetch
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.types.is_empty() {
            return Err(ConfigError::Invalid(
                "queue must accept at least one job type".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency cannot be zero".into()));
        }
        if self.cargo == 0 {
            return Err(ConfigError::Invalid("cargo cannot be zero".into()));
        }
        Ok(())
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()
    }
}
