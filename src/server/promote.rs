//! The promotion loop.
//!
//! One promotion actor exists per collection. Promotion is time-driven
//! because `after` passes without any write to observe; dependency
//! resolution is event-driven and never polled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::job::{JobStatus, LogEntry};
use crate::store::{JobMutation, JobQuery, JobStore, StoreError};

/// Buffer size for the command channel between handle and loop.
const COMMAND_CHANNEL_BUFFER: usize = 8;

/// Commands accepted by the promotion loop.
enum PromoteCommand {
    /// Run a pass now and report how many jobs were promoted.
    Trigger {
        response: oneshot::Sender<Result<usize, StoreError>>,
    },
    /// Stop the loop.
    Shutdown { response: oneshot::Sender<()> },
}

/// Handle to a running promotion loop.
pub struct PromoteHandle {
    command_tx: mpsc::Sender<PromoteCommand>,
    task: JoinHandle<()>,
}

impl PromoteHandle {
    /// Spawn the promotion loop over the given store.
    pub(crate) fn spawn(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let task = tokio::spawn(run(store, interval, command_rx));
        Self { command_tx, task }
    }

    /// Run one promotion pass immediately.
    pub async fn trigger(&self) -> Result<usize, StoreError> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(PromoteCommand::Trigger {
                response: response_tx,
            })
            .await
            .is_err()
        {
            return Ok(0);
        }
        response_rx.await.unwrap_or(Ok(0))
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(PromoteCommand::Shutdown {
                response: response_tx,
            })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
        let _ = self.task.await;
    }
}

/// The loop body: promote on every tick, serve commands between ticks.
async fn run(
    store: Arc<dyn JobStore>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<PromoteCommand>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately; promote right away on start
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match promote_pass(store.as_ref()).await {
                    Ok(count) if count > 0 => {
                        tracing::debug!(count, "Promoted waiting jobs to ready");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Promotion pass failed");
                    }
                }
            }

            Some(command) = command_rx.recv() => {
                match command {
                    PromoteCommand::Trigger { response } => {
                        let _ = response.send(promote_pass(store.as_ref()).await);
                    }
                    PromoteCommand::Shutdown { response } => {
                        let _ = response.send(());
                        break;
                    }
                }
            }
        }
    }
}

/// One promotion pass: every waiting job whose `after` has arrived and whose
/// dependencies are all resolved becomes ready.
pub(crate) async fn promote_pass(store: &dyn JobStore) -> Result<usize, StoreError> {
    let now = Utc::now();
    let query = JobQuery::default()
        .with_status(JobStatus::Waiting)
        .due_at(now)
        .with_no_depends();
    let mutation = JobMutation::new()
        .set_status(JobStatus::Ready)
        .set_updated(now)
        .push_log(LogEntry::info("Promoted to ready"));
    store.update(&query, &mutation, true).await
}
