//! Server shutdown drain and crash recovery.

use quarry::testing::TestServer;
use quarry::{GetWorkOptions, JobDoc, JobStatus, StopJobsOptions};
use serde_json::json;
use std::time::Duration;

use crate::common::{claim_one, ready_job};

#[tokio::test]
async fn test_get_work_is_empty_once_stopped() {
    let harness = TestServer::start().await;
    ready_job(&harness, "email").await;

    harness
        .server
        .stop_jobs(StopJobsOptions {
            timeout: Some(Duration::from_secs(60)),
        })
        .await
        .unwrap();

    let jobs = harness
        .server
        .get_work(&["email".into()], GetWorkOptions::default())
        .await
        .unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_done_is_accepted_during_the_drain_window() {
    let harness = TestServer::start().await;
    ready_job(&harness, "email").await;
    let (id, run_id) = claim_one(&harness, "email").await;

    harness
        .server
        .stop_jobs(StopJobsOptions {
            timeout: Some(Duration::from_secs(60)),
        })
        .await
        .unwrap();

    // the running job finishes within the drain window
    assert!(harness.server.job_done(id, run_id, json!({})).await.unwrap());
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Completed));
}

#[tokio::test]
async fn test_progress_goes_quiet_once_stopped() {
    let harness = TestServer::start().await;
    ready_job(&harness, "email").await;
    let (id, run_id) = claim_one(&harness, "email").await;

    harness
        .server
        .stop_jobs(StopJobsOptions {
            timeout: Some(Duration::from_secs(60)),
        })
        .await
        .unwrap();

    let reply = harness
        .server
        .job_progress(id, run_id, 1.0, 2.0)
        .await
        .unwrap();
    assert_eq!(reply, None);
}

#[tokio::test]
async fn test_drain_timeout_force_fails_running_jobs() {
    let harness = TestServer::start().await;
    ready_job(&harness, "email").await;
    let (id, _run_id) = claim_one(&harness, "email").await;

    harness
        .server
        .stop_jobs(StopJobsOptions {
            timeout: Some(Duration::from_millis(50)),
        })
        .await
        .unwrap();

    harness
        .wait_for_status(id, JobStatus::Failed, Duration::from_secs(2))
        .await;
    let doc = harness.doc_of(id).await.unwrap();
    assert!(doc.run_id.is_none());
    assert_eq!(
        doc.log.last().unwrap().message,
        "Shutdown timeout exceeded"
    );
}

#[tokio::test]
async fn test_start_jobs_cancels_a_pending_drain() {
    let harness = TestServer::start().await;
    ready_job(&harness, "email").await;
    let (id, run_id) = claim_one(&harness, "email").await;

    harness
        .server
        .stop_jobs(StopJobsOptions {
            timeout: Some(Duration::from_millis(100)),
        })
        .await
        .unwrap();
    harness.server.start_jobs().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Running));

    // and the worker can still finish it
    assert!(harness.server.job_done(id, run_id, json!({})).await.unwrap());
}

#[tokio::test]
async fn test_recovery_sweep_restores_run_invariant() {
    let harness = TestServer::start().await;

    // simulate a crash: a document left running with no worker attached
    let mut orphan = JobDoc::new("email", json!({}));
    orphan.status = JobStatus::Running;
    orphan.run_id = Some(quarry::RunId::new());
    let id = harness.server.store().insert(orphan).await.unwrap();

    let swept = harness.server.recover().await.unwrap();
    assert_eq!(swept, 1);

    let doc = harness.doc_of(id).await.unwrap();
    assert_eq!(doc.status, JobStatus::Failed);
    assert!(doc.run_id.is_none());
}

#[tokio::test]
async fn test_recovery_sweep_ignores_settled_jobs() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("email", json!({}))).await.unwrap();

    let swept = harness.server.recover().await.unwrap();
    assert_eq!(swept, 0);
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Waiting));
}
