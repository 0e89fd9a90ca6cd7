//! Worker-side queue behavior: cargo batching, concurrency bounds,
//! prefetch, and cancel observation.

use async_trait::async_trait;
use quarry::testing::{CompletingWorker, TestServer};
use quarry::{
    CancelOptions, JobDoc, JobHandle, JobQueue, JobStatus, QueueConfig, ShutdownLevel, Worker,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn save_many(harness: &TestServer, job_type: &str, count: usize) {
    for n in 0..count {
        harness
            .save(JobDoc::new(job_type, json!({"n": n})))
            .await
            .unwrap();
    }
    harness.promote().await;
}

async fn wait_for_count(harness: &TestServer, status: JobStatus, count: usize) {
    for _ in 0..300 {
        let docs = harness
            .server
            .store()
            .find(
                &quarry::JobQuery::default().with_status(status),
                quarry::Projection::WithoutLog,
            )
            .await
            .unwrap();
        if docs.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached {} jobs in {}", count, status);
}

fn fast_config(job_type: &str) -> QueueConfig {
    QueueConfig {
        poll_interval: Duration::from_millis(10),
        ..QueueConfig::for_type(job_type)
    }
}

/// Records the cargo size of every invocation.
struct BatchRecorder {
    sizes: std::sync::Mutex<Vec<usize>>,
}

#[async_trait]
impl Worker for BatchRecorder {
    async fn perform(&self, jobs: &mut [JobHandle]) {
        self.sizes.lock().unwrap().push(jobs.len());
        for job in jobs {
            let _ = job.done(json!({})).await;
        }
    }
}

/// Tracks the peak number of concurrent invocations.
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Worker for ConcurrencyProbe {
    async fn perform(&self, jobs: &mut [JobHandle]) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        for job in jobs {
            let _ = job.done(json!({})).await;
        }
    }
}

/// Reports progress in a loop until the server says the run is gone.
struct ProgressUntilDropped;

#[async_trait]
impl Worker for ProgressUntilDropped {
    async fn perform(&self, jobs: &mut [JobHandle]) {
        for job in jobs {
            for step in 0..1000 {
                let ack = job.progress(step as f64, 1000.0).await.unwrap();
                if !ack.is_live() {
                    return; // dropped; no resolution needed
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let _ = job.done(json!({})).await;
        }
    }
}

#[tokio::test]
async fn test_cargo_batches_jobs_per_invocation() {
    let harness = TestServer::start().await;
    save_many(&harness, "batch", 4).await;

    let recorder = Arc::new(BatchRecorder {
        sizes: std::sync::Mutex::new(Vec::new()),
    });
    let config = QueueConfig {
        cargo: 2,
        prefetch: 2,
        ..fast_config("batch")
    };
    let queue = JobQueue::new(harness.client("w1"), recorder.clone(), config).unwrap();
    let (handle, task) = queue.start();

    wait_for_count(&harness, JobStatus::Completed, 4).await;
    handle.shutdown(ShutdownLevel::Soft).await.unwrap();
    let _ = task.await;

    let sizes = recorder.sizes.lock().unwrap().clone();
    assert!(!sizes.is_empty());
    assert!(sizes.iter().all(|&s| s <= 2), "cargo bound violated: {:?}", sizes);
    assert_eq!(sizes.iter().sum::<usize>(), 4);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let harness = TestServer::start().await;
    save_many(&harness, "load", 6).await;

    let probe = Arc::new(ConcurrencyProbe {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let config = QueueConfig {
        concurrency: 2,
        ..fast_config("load")
    };
    let queue = JobQueue::new(harness.client("w1"), probe.clone(), config).unwrap();
    let (handle, task) = queue.start();

    wait_for_count(&harness, JobStatus::Completed, 6).await;
    handle.shutdown(ShutdownLevel::Soft).await.unwrap();
    let _ = task.await;

    let peak = probe.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency {} exceeded the bound", peak);
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_prefetch_claims_ahead_of_capacity() {
    let harness = TestServer::start().await;
    save_many(&harness, "slowish", 5).await;

    let probe = Arc::new(ConcurrencyProbe {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let config = QueueConfig {
        concurrency: 1,
        prefetch: 2,
        ..fast_config("slowish")
    };
    let queue = JobQueue::new(harness.client("w1"), probe, config).unwrap();
    let (handle, task) = queue.start();

    // capacity is 1*1 + 2 = 3: one in flight, two buffered
    wait_for_count(&harness, JobStatus::Running, 3).await;

    handle.shutdown(ShutdownLevel::Soft).await.unwrap();
    let _ = task.await;
    wait_for_count(&harness, JobStatus::Completed, 5).await;
}

#[tokio::test]
async fn test_worker_observes_cancel_through_progress() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("long", json!({}))).await.unwrap();
    harness.promote().await;

    let queue = JobQueue::new(
        harness.client("w1"),
        Arc::new(ProgressUntilDropped),
        fast_config("long"),
    )
    .unwrap();
    let (handle, task) = queue.start();

    wait_for_count(&harness, JobStatus::Running, 1).await;
    harness
        .server
        .job_cancel(&[id], CancelOptions::default())
        .await
        .unwrap();

    // the worker sees the rejected progress report, drops the job, and the
    // queue drains cleanly
    handle.shutdown(ShutdownLevel::Soft).await.unwrap();
    let _ = task.await;

    assert_eq!(harness.status_of(id).await, Some(JobStatus::Cancelled));
}

#[tokio::test]
async fn test_queue_only_pulls_its_types() {
    let harness = TestServer::start().await;
    save_many(&harness, "mine", 1).await;
    save_many(&harness, "theirs", 1).await;

    let queue = JobQueue::new(
        harness.client("w1"),
        Arc::new(CompletingWorker::default()),
        fast_config("mine"),
    )
    .unwrap();
    let (handle, task) = queue.start();

    wait_for_count(&harness, JobStatus::Completed, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.shutdown(ShutdownLevel::Soft).await.unwrap();
    let _ = task.await;

    let leftover = harness
        .server
        .store()
        .find(
            &quarry::JobQuery::default().with_status(JobStatus::Ready),
            quarry::Projection::WithoutLog,
        )
        .await
        .unwrap();
    assert_eq!(leftover.len(), 1);
    assert_eq!(leftover[0].job_type, "theirs");
}
