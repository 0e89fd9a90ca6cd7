//! The job server: owner of one job collection.
//!
//! A `JobServer` mediates every mutation of its collection: remote calls
//! arrive through the method registry, pass the permission gate, and mutate
//! documents through conditional store updates; the promotion loop performs
//! the time-driven `waiting -> ready` transition in the background. Multiple
//! servers (one per collection) coexist in a process, each independent.

mod methods;
mod promote;
mod registry;

pub use methods::{
    CancelOptions, FailOptions, GetJobOptions, GetWorkOptions, LogOptions, RerunOptions,
    RestartOptions, SaveOptions, StopJobsOptions,
};
pub use promote::PromoteHandle;
pub use registry::MethodName;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::access::AccessGate;
use crate::config::ServerConfig;
use crate::events::CallLog;
use crate::store::{JobStore, StoreError};

/// Errors surfaced by server methods.
///
/// Precondition misses and shutdown replies are NOT errors; they are in-band
/// `false`/`None` returns, because the caller must decide what its stale
/// intent means.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The permission gate rejected the call.
    #[error("not authorized")]
    Unauthorized,

    /// A parameter's shape or value violates the method's schema.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No such method (or a collection prefix for another server).
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The record store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A call log sink is already installed.
    #[error("call log already installed")]
    CallLogInstalled,

    /// A background actor's channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Whether job flow is running or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Promotion runs and `getWork` dispatches.
    Running,
    /// Promotion is halted and `getWork` returns empty.
    Stopped,
}

/// A job server for a single collection.
pub struct JobServer {
    store: Arc<dyn JobStore>,
    gate: AccessGate,
    config: ServerConfig,
    state: RwLock<ServerState>,
    promote: Mutex<Option<PromoteHandle>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    call_log: std::sync::Mutex<Option<Arc<dyn CallLog>>>,
}

impl JobServer {
    /// Create a server over the given store with a closed (deny-all) gate.
    ///
    /// Job flow starts stopped or running per
    /// [`ServerConfig::start_stopped`]; call [`JobServer::start_jobs`]
    /// to begin promotion either way, since construction cannot spawn the
    /// loop without an async context.
    pub fn new(store: Arc<dyn JobStore>, config: ServerConfig) -> Self {
        Self::with_gate(store, AccessGate::new(), config)
    }

    /// Create a server with an explicit permission gate.
    pub fn with_gate(store: Arc<dyn JobStore>, gate: AccessGate, config: ServerConfig) -> Self {
        Self {
            store,
            gate,
            config,
            state: RwLock::new(ServerState::Stopped),
            promote: Mutex::new(None),
            drain: Mutex::new(None),
            call_log: std::sync::Mutex::new(None),
        }
    }

    /// The collection this server owns.
    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The underlying record store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Current run/stop state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Whether job flow is stopped.
    pub async fn is_stopped(&self) -> bool {
        *self.state.read().await == ServerState::Stopped
    }

    /// Install the RPC call journal sink. At most one sink may be installed
    /// per startup cycle.
    pub fn install_call_log(&self, sink: Arc<dyn CallLog>) -> Result<(), ServerError> {
        let mut slot = self
            .call_log
            .lock()
            .map_err(|_| ServerError::Channel("call log lock poisoned".into()))?;
        if slot.is_some() {
            return Err(ServerError::CallLogInstalled);
        }
        *slot = Some(sink);
        Ok(())
    }

    /// Write one line to the installed call journal, if any.
    pub(crate) fn journal(&self, line: &str) {
        if let Ok(slot) = self.call_log.lock() {
            if let Some(sink) = slot.as_ref() {
                sink.line(line);
            }
        }
    }

    /// Start job flow: resume promotion and dispatch.
    ///
    /// Idempotent; a second call while running returns `true` without side
    /// effects. Any pending shutdown drain timer is cancelled.
    pub async fn start_jobs(&self) -> Result<bool, ServerError> {
        {
            let mut drain = self.drain.lock().await;
            if let Some(handle) = drain.take() {
                handle.abort();
            }
        }

        let mut state = self.state.write().await;
        if *state == ServerState::Running {
            return Ok(true);
        }
        *state = ServerState::Running;
        drop(state);

        let mut promote = self.promote.lock().await;
        if promote.is_none() {
            *promote = Some(PromoteHandle::spawn(
                Arc::clone(&self.store),
                self.config.promote_interval,
            ));
        }

        tracing::info!(collection = %self.config.collection, "Job flow started");
        Ok(true)
    }

    /// Stop job flow: halt promotion, make `getWork` return empty, and
    /// force-fail jobs still running after the drain timeout.
    pub async fn stop_jobs(&self, options: StopJobsOptions) -> Result<bool, ServerError> {
        {
            let mut state = self.state.write().await;
            *state = ServerState::Stopped;
        }

        if let Some(handle) = self.promote.lock().await.take() {
            handle.shutdown().await;
        }

        let timeout = options.timeout.unwrap_or(self.config.stop_timeout);
        let store = Arc::clone(&self.store);
        let collection = self.config.collection.clone();
        let mut drain = self.drain.lock().await;
        if let Some(previous) = drain.take() {
            previous.abort();
        }
        *drain = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            match methods::force_fail_running(store.as_ref(), "Shutdown timeout exceeded").await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::warn!(collection = %collection, count, "Force-failed running jobs at shutdown");
                }
                Err(e) => {
                    tracing::error!(collection = %collection, error = %e, "Shutdown drain sweep failed");
                }
            }
        }));

        tracing::info!(collection = %self.config.collection, "Job flow stopped");
        Ok(true)
    }

    /// Startup recovery sweep: force-fail every job found `running`.
    ///
    /// A crash can leave documents in `running` with no worker attached;
    /// this restores the run-state invariant. Returns the number of jobs
    /// swept.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let count =
            methods::force_fail_running(self.store.as_ref(), "Run interrupted by server restart")
                .await?;
        if count > 0 {
            tracing::warn!(
                collection = %self.config.collection,
                count,
                "Recovered interrupted runs"
            );
        }
        Ok(count)
    }

    /// Run one promotion pass immediately, outside the timer.
    pub async fn promote_now(&self) -> Result<usize, ServerError> {
        if self.is_stopped().await {
            return Ok(0);
        }
        Ok(promote::promote_pass(self.store.as_ref()).await?)
    }

    pub(crate) fn gate(&self) -> &AccessGate {
        &self.gate
    }
}
