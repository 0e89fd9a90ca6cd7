//! Testing utilities for users of the quarry library.
//!
//! This module provides helpers for exercising job flows end to end:
//!
//! - [`TestServer`]: an in-process server over a memory store with a
//!   permissive gate and a fast promotion tick
//! - [`CompletingWorker`]: resolves every job with a fixed result
//! - [`FlakyWorker`]: fails a configurable number of runs, then succeeds

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessGate;
use crate::config::ServerConfig;
use crate::core::job::{JobDoc, JobStatus};
use crate::core::types::{CallerId, JobId};
use crate::events::MemoryCallLog;
use crate::server::{JobServer, SaveOptions, ServerError};
use crate::store::{JobQuery, MemoryStore, Projection};
use crate::worker::{JobHandle, LocalClient, Worker};

/// An in-process server wired for tests: memory store, permissive gate,
/// fast promotion tick, call journal captured in memory.
pub struct TestServer {
    pub server: Arc<JobServer>,
    pub journal: Arc<MemoryCallLog>,
}

impl TestServer {
    /// Start a test server with a 25 ms promotion tick.
    pub async fn start() -> Self {
        Self::with_config(ServerConfig {
            collection: "test".to_string(),
            promote_interval: Duration::from_millis(25),
            ..ServerConfig::default()
        })
        .await
    }

    /// Start a test server with explicit configuration.
    pub async fn with_config(config: ServerConfig) -> Self {
        let start_stopped = config.start_stopped;
        let server = Arc::new(JobServer::with_gate(
            Arc::new(MemoryStore::new()),
            AccessGate::permissive(),
            config,
        ));
        let journal = Arc::new(MemoryCallLog::new());
        server
            .install_call_log(journal.clone())
            .expect("fresh server has no call log");
        if !start_stopped {
            server.start_jobs().await.expect("start_jobs");
        }
        Self { server, journal }
    }

    /// A client calling as the given identity.
    pub fn client(&self, caller: impl Into<CallerId>) -> Arc<LocalClient> {
        Arc::new(LocalClient::new(Arc::clone(&self.server), caller))
    }

    /// Save a job with default options.
    pub async fn save(&self, doc: JobDoc) -> Result<JobId, ServerError> {
        self.server.job_save(doc, SaveOptions::default()).await
    }

    /// Fetch a job's full document, log included.
    pub async fn doc_of(&self, id: JobId) -> Option<JobDoc> {
        self.server
            .store()
            .find(&JobQuery::by_id(id), Projection::Full)
            .await
            .ok()?
            .into_iter()
            .next()
    }

    /// Fetch a job's current status.
    pub async fn status_of(&self, id: JobId) -> Option<JobStatus> {
        self.doc_of(id).await.map(|doc| doc.status)
    }

    /// Run a promotion pass immediately.
    pub async fn promote(&self) -> usize {
        self.server.promote_now().await.expect("promotion pass")
    }

    /// Wait for a job to reach an expected status, polling the store.
    ///
    /// This is more reliable than fixed sleeps since execution time can
    /// vary. Polls every 10 ms and panics when the timeout is reached first.
    pub async fn wait_for_status(
        &self,
        id: JobId,
        expected: JobStatus,
        timeout: Duration,
    ) -> JobDoc {
        let start = tokio::time::Instant::now();
        loop {
            if let Some(doc) = self.doc_of(id).await {
                if doc.status == expected {
                    return doc;
                }
                if start.elapsed() > timeout {
                    panic!(
                        "Timeout waiting for job {} to reach {}, current status: {}",
                        id, expected, doc.status
                    );
                }
            } else if start.elapsed() > timeout {
                panic!("Timeout waiting for job {}: not found", id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Worker that resolves every job with a fixed result.
pub struct CompletingWorker {
    result: Value,
}

impl CompletingWorker {
    pub fn new(result: Value) -> Self {
        Self { result }
    }
}

impl Default for CompletingWorker {
    fn default() -> Self {
        Self::new(json!({"ok": true}))
    }
}

#[async_trait]
impl Worker for CompletingWorker {
    async fn perform(&self, jobs: &mut [JobHandle]) {
        for job in jobs {
            let _ = job.done(self.result.clone()).await;
        }
    }
}

/// Worker that fails a configurable number of runs before succeeding.
pub struct FlakyWorker {
    remaining_failures: AtomicU32,
}

impl FlakyWorker {
    /// Fail the first `failures` runs, succeed afterwards.
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn perform(&self, jobs: &mut [JobHandle]) {
        for job in jobs {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                let _ = job.fail(json!("induced failure"), false).await;
            } else {
                let _ = job.done(json!({"ok": true})).await;
            }
        }
    }
}
