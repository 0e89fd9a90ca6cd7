//! Dependency resolution: antecedents gate promotion, completion cascades,
//! and saves validate the graph.

use quarry::testing::TestServer;
use quarry::{GetWorkOptions, JobDoc, JobId, JobStatus, ServerError};
use serde_json::json;

use crate::common::claim_one;

#[tokio::test]
async fn test_dependent_waits_until_antecedent_completes() {
    let harness = TestServer::start().await;

    let first = harness.save(JobDoc::new("extract", json!({}))).await.unwrap();
    let second = harness
        .save(JobDoc::new("load", json!({})).with_depends(vec![first]))
        .await
        .unwrap();

    harness.promote().await;
    assert_eq!(harness.status_of(first).await, Some(JobStatus::Ready));
    assert_eq!(harness.status_of(second).await, Some(JobStatus::Waiting));

    // no work of the dependent type is available yet
    let jobs = harness
        .server
        .get_work(&["load".into()], GetWorkOptions::default())
        .await
        .unwrap();
    assert!(jobs.is_empty());

    let (id, run_id) = claim_one(&harness, "extract").await;
    harness.server.job_done(id, run_id, json!({})).await.unwrap();

    let doc = harness.doc_of(second).await.unwrap();
    assert!(doc.depends.is_empty());
    assert_eq!(doc.resolved, vec![first]);

    harness.promote().await;
    assert_eq!(harness.status_of(second).await, Some(JobStatus::Ready));
}

#[tokio::test]
async fn test_resolution_order_does_not_matter() {
    let harness = TestServer::start().await;

    let a = harness.save(JobDoc::new("a", json!({}))).await.unwrap();
    let b = harness.save(JobDoc::new("b", json!({}))).await.unwrap();
    let dependent = harness
        .save(JobDoc::new("c", json!({})).with_depends(vec![a, b]))
        .await
        .unwrap();
    harness.promote().await;

    // complete b first, then a
    for job_type in ["b", "a"] {
        let (id, run_id) = claim_one(&harness, job_type).await;
        harness.server.job_done(id, run_id, json!({})).await.unwrap();
    }

    let doc = harness.doc_of(dependent).await.unwrap();
    assert!(doc.depends.is_empty());
    let mut resolved = doc.resolved.clone();
    resolved.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(resolved, expected);

    harness.promote().await;
    assert_eq!(harness.status_of(dependent).await, Some(JobStatus::Ready));
}

#[tokio::test]
async fn test_dependent_log_records_the_resolution() {
    let harness = TestServer::start().await;

    let first = harness.save(JobDoc::new("a", json!({}))).await.unwrap();
    let second = harness
        .save(JobDoc::new("b", json!({})).with_depends(vec![first]))
        .await
        .unwrap();
    harness.promote().await;

    let (id, run_id) = claim_one(&harness, "a").await;
    harness.server.job_done(id, run_id, json!({})).await.unwrap();

    let doc = harness.doc_of(second).await.unwrap();
    assert!(doc
        .log
        .iter()
        .any(|e| e.message.contains("Dependency resolved")));
}

#[tokio::test]
async fn test_save_rejects_self_dependency_cycle() {
    let harness = TestServer::start().await;

    let mut doc = JobDoc::new("a", json!({}));
    doc.depends = vec![doc.id];

    let result = harness.save(doc).await;
    match result {
        Err(ServerError::InvalidArgument(msg)) => assert!(msg.contains("cycle")),
        other => panic!("expected cycle rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_save_rejects_unknown_dependency() {
    let harness = TestServer::start().await;

    let result = harness
        .save(JobDoc::new("a", json!({})).with_depends(vec![JobId::new()]))
        .await;
    match result {
        Err(ServerError::InvalidArgument(msg)) => assert!(msg.contains("unknown dependency")),
        other => panic!("expected unknown-dependency rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_save_rejects_duplicate_dependency() {
    let harness = TestServer::start().await;
    let first = harness.save(JobDoc::new("a", json!({}))).await.unwrap();

    let result = harness
        .save(JobDoc::new("b", json!({})).with_depends(vec![first, first]))
        .await;
    assert!(matches!(result, Err(ServerError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_duplicate_cascade_write_is_a_no_op() {
    let harness = TestServer::start().await;

    let first = harness.save(JobDoc::new("a", json!({}))).await.unwrap();
    let second = harness
        .save(JobDoc::new("b", json!({})).with_depends(vec![first]))
        .await
        .unwrap();
    harness.promote().await;

    let (id, run_id) = claim_one(&harness, "a").await;
    harness.server.job_done(id, run_id, json!({})).await.unwrap();

    // replay the cascade mutation directly; resolution is idempotent
    harness
        .server
        .store()
        .update(
            &quarry::JobQuery::by_id(second),
            &quarry::JobMutation::new().resolve_dependency(first),
            false,
        )
        .await
        .unwrap();

    let doc = harness.doc_of(second).await.unwrap();
    assert!(doc.depends.is_empty());
    assert_eq!(doc.resolved, vec![first]);
}
