//! End-to-end lifecycle tests: save, promote, dispatch, complete.

use quarry::testing::TestServer;
use quarry::{
    Budget, GetJobOptions, GetWorkOptions, JobDoc, JobStatus, RepeatPolicy, RerunOptions,
    ServerConfig, ServerError,
};
use serde_json::json;
use std::time::Duration;

use crate::common::{claim_one, ready_job};

#[tokio::test]
async fn test_save_dispatch_complete_round_trip() {
    let harness = TestServer::start().await;

    let id = harness
        .save(JobDoc::new("email", json!({"to": "a@b.c"})))
        .await
        .unwrap();
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Waiting));

    harness.promote().await;
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Ready));

    let jobs = harness
        .server
        .get_work(&["email".into()], GetWorkOptions::default())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, id);
    assert_eq!(jobs[0].status, JobStatus::Running);
    let run_id = jobs[0].run_id.unwrap();

    let done = harness
        .server
        .job_done(id, run_id, json!({"ok": true}))
        .await
        .unwrap();
    assert!(done);

    let doc = harness.doc_of(id).await.unwrap();
    assert_eq!(doc.status, JobStatus::Completed);
    assert_eq!(doc.result, Some(json!({"ok": true})));
    assert!(doc.run_id.is_none());
}

#[tokio::test]
async fn test_saved_doc_round_trips_through_get_job() {
    let harness = TestServer::start().await;

    let saved = JobDoc::new("email", json!({"k": [1, 2, 3]})).with_priority(-5);
    let id = harness.save(saved.clone()).await.unwrap();

    let fetched = harness
        .server
        .get_job(&[id], GetJobOptions { get_log: true })
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, id);
    assert_eq!(fetched[0].job_type, "email");
    assert_eq!(fetched[0].data, json!({"k": [1, 2, 3]}));
    assert_eq!(fetched[0].priority, -5);
    assert_eq!(fetched[0].log.last().unwrap().message, "Job submitted");
}

#[tokio::test]
async fn test_get_job_elides_log_by_default() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("email", json!({}))).await.unwrap();

    let fetched = harness
        .server
        .get_job(&[id], GetJobOptions::default())
        .await
        .unwrap();
    assert!(fetched[0].log.is_empty());
}

#[tokio::test]
async fn test_pause_is_idempotent() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("email", json!({}))).await.unwrap();

    assert!(harness.server.job_pause(&[id]).await.unwrap());
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Paused));

    // pausing an already-paused job succeeds and changes nothing
    assert!(harness.server.job_pause(&[id]).await.unwrap());
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Paused));
}

#[tokio::test]
async fn test_paused_job_is_never_promoted() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("email", json!({}))).await.unwrap();

    harness.server.job_pause(&[id]).await.unwrap();
    harness.promote().await;
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Paused));

    harness.server.job_resume(&[id]).await.unwrap();
    harness.promote().await;
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Ready));
}

#[tokio::test]
async fn test_pause_rejects_running_job() {
    let harness = TestServer::start().await;
    let id = ready_job(&harness, "email").await;
    claim_one(&harness, "email").await;

    assert!(!harness.server.job_pause(&[id]).await.unwrap());
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Running));
}

#[tokio::test]
async fn test_remove_is_legal_only_in_terminal_states() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("email", json!({}))).await.unwrap();

    // waiting is not terminal
    assert!(!harness.server.job_remove(&[id]).await.unwrap());
    assert!(harness.doc_of(id).await.is_some());

    harness
        .server
        .job_cancel(&[id], Default::default())
        .await
        .unwrap();
    assert!(harness.server.job_remove(&[id]).await.unwrap());
    assert!(harness.doc_of(id).await.is_none());
}

#[tokio::test]
async fn test_save_rejects_duplicate_id() {
    let harness = TestServer::start().await;
    let doc = JobDoc::new("email", json!({}));
    harness.save(doc.clone()).await.unwrap();

    let second = harness.save(doc).await;
    assert!(matches!(second, Err(ServerError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_no_two_get_work_calls_share_a_claim() {
    let harness = TestServer::start().await;
    ready_job(&harness, "email").await;

    let queues_a = ["email".to_string()];
    let queues_b = ["email".to_string()];
    let (a, b) = tokio::join!(
        harness
            .server
            .get_work(&queues_a, GetWorkOptions::default()),
        harness
            .server
            .get_work(&queues_b, GetWorkOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // exactly one caller wins the single ready job
    assert_eq!(a.len() + b.len(), 1);
}

#[tokio::test]
async fn test_dispatch_order_honors_priority_then_age() {
    let harness = TestServer::start().await;

    let low = harness
        .save(JobDoc::new("email", json!({})).with_priority(10))
        .await
        .unwrap();
    let high = harness
        .save(JobDoc::new("email", json!({})).with_priority(-10))
        .await
        .unwrap();
    let normal = harness
        .save(JobDoc::new("email", json!({})))
        .await
        .unwrap();
    harness.promote().await;

    let jobs = harness
        .server
        .get_work(&["email".into()], GetWorkOptions { max_jobs: 3 })
        .await
        .unwrap();
    let order: Vec<_> = jobs.iter().map(|j| j.id).collect();
    assert_eq!(order, vec![high, normal, low]);
}

#[tokio::test]
async fn test_repeat_spawns_waiting_sibling() {
    let harness = TestServer::start().await;

    harness
        .save(
            JobDoc::new("report", json!({"day": 1}))
                .with_repeat(RepeatPolicy::times(1, Duration::ZERO)),
        )
        .await
        .unwrap();
    harness.promote().await;
    let (id, run_id) = {
        let jobs = harness
            .server
            .get_work(&["report".into()], GetWorkOptions::default())
            .await
            .unwrap();
        (jobs[0].id, jobs[0].run_id.unwrap())
    };
    harness.server.job_done(id, run_id, json!({})).await.unwrap();

    let all = harness
        .server
        .store()
        .find(&quarry::JobQuery::default(), quarry::Projection::WithoutLog)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let sibling = all.iter().find(|d| d.id != id).unwrap();
    assert_eq!(sibling.status, JobStatus::Waiting);
    assert_eq!(sibling.job_type, "report");
    assert_eq!(sibling.data, json!({"day": 1}));
    assert_eq!(sibling.repeated, 1);
    assert_eq!(sibling.repeats, Budget::count(0));

    let original = harness.doc_of(id).await.unwrap();
    assert_eq!(original.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_rerun_clones_a_completed_job() {
    let harness = TestServer::start().await;
    ready_job(&harness, "report").await;
    let (id, run_id) = claim_one(&harness, "report").await;
    harness.server.job_done(id, run_id, json!({})).await.unwrap();

    let new_id = harness
        .server
        .job_rerun(id, RerunOptions::default())
        .await
        .unwrap()
        .expect("completed job reruns");
    assert_ne!(new_id, id);
    assert_eq!(harness.status_of(new_id).await, Some(JobStatus::Waiting));

    // the original is untouched
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Completed));
}

#[tokio::test]
async fn test_rerun_rejects_non_completed_job() {
    let harness = TestServer::start().await;
    let id = harness.save(JobDoc::new("report", json!({}))).await.unwrap();

    let result = harness
        .server
        .job_rerun(id, RerunOptions::default())
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_stopped_server_accepts_saves_but_hands_out_nothing() {
    // scenario: the server starts with job flow stopped
    let harness = TestServer::with_config(ServerConfig {
        collection: "test".into(),
        promote_interval: Duration::from_millis(25),
        start_stopped: true,
        ..ServerConfig::default()
    })
    .await;

    let id = harness.save(JobDoc::new("email", json!({}))).await.unwrap();

    let jobs = harness
        .server
        .get_work(&["email".into()], GetWorkOptions::default())
        .await
        .unwrap();
    assert!(jobs.is_empty());
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Waiting));

    // startJobs resumes promotion; the job becomes ready within a tick
    harness.server.start_jobs().await.unwrap();
    harness
        .wait_for_status(id, JobStatus::Ready, Duration::from_secs(2))
        .await;
}

#[tokio::test]
async fn test_paused_at_creation() {
    let harness = TestServer::start().await;
    let id = harness
        .save(JobDoc::new("email", json!({})).paused())
        .await
        .unwrap();

    harness.promote().await;
    assert_eq!(harness.status_of(id).await, Some(JobStatus::Paused));
}
