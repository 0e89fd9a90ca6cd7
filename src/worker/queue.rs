//! Worker-side pull scheduler.
//!
//! The queue runs a single cooperative loop: a poll timer, a command
//! channel, and per-invocation completion signals interleave in one
//! `select!`. Worker invocations themselves run as independent tasks; their
//! only shared state with the loop is the completion channel, which is what
//! bounds concurrency.

use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use super::{JobClient, JobHandle, Worker};
use crate::config::{ConfigError, QueueConfig};
use crate::core::job::JobDoc;
use crate::core::types::{JobId, RunId};

/// Buffer size for the command channel between handle and loop.
const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Errors surfaced by the queue and its handle.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The loop's channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),
}

/// How forcefully to drain the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownLevel {
    /// Stop polling; let buffered and running jobs finish naturally.
    Soft,
    /// Stop polling; let running jobs finish, fail buffered ones.
    Normal,
    /// Fail buffered and running jobs immediately and return.
    Hard,
}

/// State of the queue loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Polling and starting work.
    Running,
    /// Holding: no polling, running work continues.
    Paused,
    /// Draining or finished.
    Stopped,
}

/// Commands accepted by the queue loop.
enum QueueCommand {
    Pause { response: oneshot::Sender<()> },
    Resume { response: oneshot::Sender<()> },
    Trigger { response: oneshot::Sender<()> },
    Shutdown {
        level: ShutdownLevel,
        response: oneshot::Sender<()>,
    },
}

/// Handle for controlling a running queue.
#[derive(Clone)]
pub struct QueueHandle {
    command_tx: mpsc::Sender<QueueCommand>,
    state: Arc<RwLock<QueueState>>,
}

impl QueueHandle {
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> QueueCommand,
        operation: &str,
    ) -> Result<(), QueueError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| QueueError::Channel(format!("failed to send {} command", operation)))?;
        response_rx.await.map_err(|_| {
            QueueError::Channel(format!("failed to receive {} response", operation))
        })?;
        Ok(())
    }

    /// Stop polling; running work continues.
    pub async fn pause(&self) -> Result<(), QueueError> {
        self.send_unit_command(|response| QueueCommand::Pause { response }, "pause")
            .await
    }

    /// Resume polling.
    pub async fn resume(&self) -> Result<(), QueueError> {
        self.send_unit_command(|response| QueueCommand::Resume { response }, "resume")
            .await
    }

    /// Poll for work now, outside the timer.
    pub async fn trigger(&self) -> Result<(), QueueError> {
        self.send_unit_command(|response| QueueCommand::Trigger { response }, "trigger")
            .await
    }

    /// Drain the queue at the given level. Resolves when the drain policy
    /// is satisfied.
    pub async fn shutdown(&self, level: ShutdownLevel) -> Result<(), QueueError> {
        self.send_unit_command(
            |response| QueueCommand::Shutdown { level, response },
            "shutdown",
        )
        .await
    }

    /// Current queue state.
    pub async fn state(&self) -> QueueState {
        *self.state.read().await
    }

    /// Whether the queue is polling.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == QueueState::Running
    }
}

/// A worker-side job queue.
pub struct JobQueue {
    config: QueueConfig,
    client: Arc<dyn JobClient>,
    worker: Arc<dyn Worker>,
}

impl JobQueue {
    /// Create a queue over a client and worker. Validates the config.
    pub fn new(
        client: Arc<dyn JobClient>,
        worker: Arc<dyn Worker>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            config,
            client,
            worker,
        })
    }

    /// Start the pull loop and return a control handle.
    pub fn start(self) -> (QueueHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (done_tx, done_rx) = mpsc::channel(self.config.concurrency.max(1) * 2);
        let state = Arc::new(RwLock::new(QueueState::Running));

        let handle = QueueHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let queue_loop = QueueLoop {
            config: self.config,
            client: self.client,
            worker: self.worker,
            buffered: VecDeque::new(),
            invocations: HashMap::new(),
            next_invocation: 0,
            done_tx,
        };
        let task = tokio::spawn(queue_loop.run(command_rx, done_rx, state));

        (handle, task)
    }
}

/// One in-flight worker invocation.
struct Invocation {
    task: JoinHandle<()>,
    jobs: Vec<(JobId, RunId)>,
}

/// The loop's mutable state.
struct QueueLoop {
    config: QueueConfig,
    client: Arc<dyn JobClient>,
    worker: Arc<dyn Worker>,
    buffered: VecDeque<JobDoc>,
    invocations: HashMap<u64, Invocation>,
    next_invocation: u64,
    done_tx: mpsc::Sender<u64>,
}

impl QueueLoop {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<QueueCommand>,
        mut done_rx: mpsc::Receiver<u64>,
        state: Arc<RwLock<QueueState>>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending_shutdown: Option<(ShutdownLevel, oneshot::Sender<()>)> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *state.read().await == QueueState::Running {
                        self.fill().await;
                    }
                }

                Some(finished) = done_rx.recv() => {
                    self.invocations.remove(&finished);
                    match pending_shutdown.take() {
                        Some((level, response)) => {
                            if level == ShutdownLevel::Soft {
                                self.start_invocations();
                            }
                            if self.drained() {
                                let _ = response.send(());
                                break;
                            }
                            pending_shutdown = Some((level, response));
                        }
                        None => {
                            if *state.read().await == QueueState::Running {
                                self.fill().await;
                            }
                        }
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        QueueCommand::Pause { response } => {
                            *state.write().await = QueueState::Paused;
                            let _ = response.send(());
                        }
                        QueueCommand::Resume { response } => {
                            *state.write().await = QueueState::Running;
                            self.fill().await;
                            let _ = response.send(());
                        }
                        QueueCommand::Trigger { response } => {
                            if *state.read().await == QueueState::Running {
                                self.fill().await;
                            }
                            let _ = response.send(());
                        }
                        QueueCommand::Shutdown { level, response } => {
                            *state.write().await = QueueState::Stopped;
                            match level {
                                ShutdownLevel::Hard => {
                                    self.fail_buffered().await;
                                    self.abort_running().await;
                                    let _ = response.send(());
                                    break;
                                }
                                ShutdownLevel::Normal => {
                                    self.fail_buffered().await;
                                    if self.drained() {
                                        let _ = response.send(());
                                        break;
                                    }
                                    pending_shutdown = Some((level, response));
                                }
                                ShutdownLevel::Soft => {
                                    self.start_invocations();
                                    if self.drained() {
                                        let _ = response.send(());
                                        break;
                                    }
                                    pending_shutdown = Some((level, response));
                                }
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!("Queue loop exited");
    }

    fn drained(&self) -> bool {
        self.invocations.is_empty() && self.buffered.is_empty()
    }

    fn in_flight_jobs(&self) -> usize {
        self.invocations.values().map(|i| i.jobs.len()).sum()
    }

    /// Start buffered work, then poll for the shortfall below capacity.
    async fn fill(&mut self) {
        self.start_invocations();

        let outstanding = self.buffered.len() + self.in_flight_jobs();
        let capacity = self.config.capacity();
        if outstanding >= capacity {
            return;
        }
        let shortfall = capacity - outstanding;
        match self.client.get_work(&self.config.types, shortfall).await {
            Ok(jobs) if !jobs.is_empty() => {
                tracing::debug!(count = jobs.len(), "Fetched work");
                self.buffered.extend(jobs);
                self.start_invocations();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "getWork failed; will poll again");
            }
        }
    }

    /// Package buffered jobs into cargos and spawn invocations while
    /// concurrency slots are free.
    fn start_invocations(&mut self) {
        while self.invocations.len() < self.config.concurrency && !self.buffered.is_empty() {
            let take = self.config.cargo.min(self.buffered.len());
            let mut handles = Vec::with_capacity(take);
            let mut jobs = Vec::with_capacity(take);
            for _ in 0..take {
                let doc = match self.buffered.pop_front() {
                    Some(doc) => doc,
                    None => break,
                };
                match doc.run_id {
                    Some(run_id) => {
                        jobs.push((doc.id, run_id));
                        handles.push(JobHandle::new(doc, run_id, Arc::clone(&self.client)));
                    }
                    None => {
                        tracing::warn!(job_id = %doc.id, "Dispatched job carries no run id; dropping");
                    }
                }
            }
            if handles.is_empty() {
                continue;
            }

            let invocation_id = self.next_invocation;
            self.next_invocation += 1;
            let worker = Arc::clone(&self.worker);
            let done_tx = self.done_tx.clone();
            let task = tokio::spawn(async move {
                let mut handles = handles;
                worker.perform(&mut handles).await;
                for handle in &mut handles {
                    if !handle.is_resolved() && !handle.is_dropped() {
                        tracing::warn!(
                            job_id = %handle.id(),
                            "Worker returned without resolving job; failing it"
                        );
                        let _ = handle
                            .fail(json!("Worker returned without resolving job"), false)
                            .await;
                    }
                }
                let _ = done_tx.send(invocation_id).await;
            });
            self.invocations.insert(invocation_id, Invocation { task, jobs });
        }
    }

    /// Fail every buffered-but-not-started job back to the server.
    async fn fail_buffered(&mut self) {
        while let Some(doc) = self.buffered.pop_front() {
            if let Some(run_id) = doc.run_id {
                let _ = self
                    .client
                    .fail(doc.id, run_id, json!("Queue shut down before job started"), false)
                    .await;
            }
        }
    }

    /// Abort in-flight invocations and fail their jobs. Jobs a worker
    /// already resolved miss the precondition server-side, which is the
    /// desired no-op.
    async fn abort_running(&mut self) {
        for (_, invocation) in self.invocations.drain() {
            invocation.task.abort();
            for (id, run_id) in invocation.jobs {
                let _ = self
                    .client
                    .fail(id, run_id, json!("Queue hard shutdown"), false)
                    .await;
            }
        }
    }
}
