//! quarry - a persistent, distributed job queue.
//!
//! A server-resident [`JobServer`] stores jobs in a durable record store
//! and mediates their lifecycle among remote creators, managers, and
//! workers. Workers run a pull-based [`JobQueue`] that bounds concurrency
//! and drains cleanly on shutdown.

pub mod access;
pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod server;
pub mod store;
pub mod testing;
pub mod worker;

pub use crate::core::job::{priority, JobDoc, JobStatus, LogEntry, LogLevel, Progress};
pub use crate::core::policy::{Budget, RepeatPolicy, RetryPolicy};
pub use crate::core::types::{CallerId, JobId, RunId};

pub use access::{AccessGate, AccessRule, Scope};

pub use config::{
    load_config, ApiConfig, CancelRepeatsMatch, Config, ConfigError, QueueConfig, ServerConfig,
    StaleRunReply, StoreConfig,
};

pub use events::{CallLog, MemoryCallLog, TracingCallLog};

pub use server::{
    CancelOptions, FailOptions, GetJobOptions, GetWorkOptions, JobServer, LogOptions, MethodName,
    RerunOptions, RestartOptions, SaveOptions, ServerError, ServerState, StopJobsOptions,
};

pub use store::{
    FieldOp, JobMutation, JobQuery, JobStore, MemoryStore, Projection, StoreError,
};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

pub use worker::{
    Ack, ClientError, JobClient, JobHandle, JobQueue, LocalClient, QueueError, QueueHandle,
    QueueState, ShutdownLevel, Worker,
};
