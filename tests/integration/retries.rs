//! Retry budget behavior: re-queue on failure, exhaustion, the forever
//! sentinel, and fatal failures.

use quarry::testing::TestServer;
use quarry::{Budget, FailOptions, JobDoc, JobStatus, RetryPolicy};
use serde_json::json;
use std::time::Duration;

use crate::common::claim_one;

async fn save_with_retries(harness: &TestServer, retries: Budget) -> quarry::JobId {
    let id = harness
        .save(JobDoc::new("flaky", json!({})).with_retry(RetryPolicy {
            retries,
            wait: Duration::ZERO,
        }))
        .await
        .unwrap();
    harness.promote().await;
    id
}

async fn fail_once(harness: &TestServer, fatal: bool) -> bool {
    let (id, run_id) = claim_one(harness, "flaky").await;
    harness
        .server
        .job_fail(id, run_id, json!("boom"), FailOptions { fatal })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_retry_budget_counts_down_to_terminal_failure() {
    let harness = TestServer::start().await;
    let id = save_with_retries(&harness, Budget::count(2)).await;

    // first failure: back to waiting, one retry consumed
    assert!(fail_once(&harness, false).await);
    let doc = harness.doc_of(id).await.unwrap();
    assert_eq!(doc.status, JobStatus::Waiting);
    assert_eq!(doc.retries, Budget::count(1));
    assert_eq!(doc.retried, 1);
    assert!(doc.run_id.is_none());

    // second failure: budget empty but the job still waits for its last run
    harness.promote().await;
    assert!(fail_once(&harness, false).await);
    let doc = harness.doc_of(id).await.unwrap();
    assert_eq!(doc.status, JobStatus::Waiting);
    assert_eq!(doc.retries, Budget::count(0));
    assert_eq!(doc.retried, 2);

    // third failure: terminal
    harness.promote().await;
    assert!(fail_once(&harness, false).await);
    let doc = harness.doc_of(id).await.unwrap();
    assert_eq!(doc.status, JobStatus::Failed);
    assert_eq!(doc.retried, 2);
}

#[tokio::test]
async fn test_retry_conserves_total_budget() {
    let harness = TestServer::start().await;
    let id = save_with_retries(&harness, Budget::count(3)).await;
    let initial_total = 3u32;

    for _ in 0..2 {
        assert!(fail_once(&harness, false).await);
        let doc = harness.doc_of(id).await.unwrap();
        assert_eq!(doc.retries.remaining() + doc.retried, initial_total);
        harness.promote().await;
    }
}

#[tokio::test]
async fn test_fatal_failure_skips_remaining_retries() {
    let harness = TestServer::start().await;
    let id = save_with_retries(&harness, Budget::count(5)).await;

    assert!(fail_once(&harness, true).await);
    let doc = harness.doc_of(id).await.unwrap();
    assert_eq!(doc.status, JobStatus::Failed);
    // no retry was consumed by the fatal path
    assert_eq!(doc.retries, Budget::count(5));
    assert_eq!(doc.retried, 0);
}

#[tokio::test]
async fn test_forever_retries_never_exhaust() {
    let harness = TestServer::start().await;
    let id = save_with_retries(&harness, Budget::FOREVER).await;

    for expected_retried in 1..=3 {
        assert!(fail_once(&harness, false).await);
        let doc = harness.doc_of(id).await.unwrap();
        assert_eq!(doc.status, JobStatus::Waiting);
        assert!(doc.retries.is_forever());
        assert_eq!(doc.retried, expected_retried);
        harness.promote().await;
    }
}

#[tokio::test]
async fn test_retry_wait_defers_eligibility() {
    let harness = TestServer::start().await;
    harness
        .save(JobDoc::new("flaky", json!({})).with_retry(RetryPolicy::times(
            1,
            Duration::from_secs(3600),
        )))
        .await
        .unwrap();
    harness.promote().await;

    let (id, run_id) = claim_one(&harness, "flaky").await;
    harness
        .server
        .job_fail(id, run_id, json!("boom"), FailOptions::default())
        .await
        .unwrap();

    // the retried run is an hour away; promotion must not pick it up
    harness.promote().await;
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Waiting));
}

#[tokio::test]
async fn test_failure_log_entry_carries_the_error() {
    let harness = TestServer::start().await;
    save_with_retries(&harness, Budget::count(0)).await;

    let (id, run_id) = claim_one(&harness, "flaky").await;
    harness
        .server
        .job_fail(id, run_id, json!("disk on fire"), FailOptions::default())
        .await
        .unwrap();

    let doc = harness.doc_of(id).await.unwrap();
    let last = doc.log.last().unwrap();
    assert_eq!(last.level, quarry::LogLevel::Danger);
    assert!(last.message.contains("disk on fire"));
}

#[tokio::test]
async fn test_stale_fail_report_is_rejected() {
    let harness = TestServer::start().await;
    save_with_retries(&harness, Budget::count(1)).await;

    let (id, run_id) = claim_one(&harness, "flaky").await;
    assert!(fail_once_with(&harness, id, run_id).await);

    // the run was superseded; a duplicate report misses its precondition
    assert!(!fail_once_with(&harness, id, run_id).await);
}

async fn fail_once_with(harness: &TestServer, id: quarry::JobId, run_id: quarry::RunId) -> bool {
    harness
        .server
        .job_fail(id, run_id, json!("boom"), FailOptions::default())
        .await
        .unwrap()
}
