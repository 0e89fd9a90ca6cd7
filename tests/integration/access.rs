//! Permission gate enforcement over the dispatch boundary.

use quarry::{
    AccessGate, AccessRule, CallerId, JobServer, MemoryCallLog, MemoryStore, Scope, ServerConfig,
    ServerError,
};
use serde_json::json;
use std::sync::Arc;

/// Gate with one identity per role.
fn role_gate() -> AccessGate {
    let mut gate = AccessGate::new();
    gate.allow(Scope::Admin, AccessRule::identity("root"));
    gate.allow(Scope::Creator, AccessRule::identity("submitter"));
    gate.allow(Scope::Worker, AccessRule::identity("runner"));
    gate.allow(Scope::Manager, AccessRule::identity("operator"));
    gate
}

fn server() -> Arc<JobServer> {
    Arc::new(JobServer::with_gate(
        Arc::new(MemoryStore::new()),
        role_gate(),
        ServerConfig::default(),
    ))
}

async fn call(
    server: &JobServer,
    caller: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, ServerError> {
    let caller = CallerId::new(caller);
    server.dispatch(Some(&caller), method, params).await
}

#[tokio::test]
async fn test_roles_map_to_method_families() {
    let server = server();

    // creator can save, worker cannot
    assert!(call(&server, "submitter", "jobSave", json!({"doc": {"type": "t"}}))
        .await
        .is_ok());
    assert!(matches!(
        call(&server, "runner", "jobSave", json!({"doc": {"type": "t"}})).await,
        Err(ServerError::Unauthorized)
    ));

    // worker can pull, creator cannot
    assert!(call(&server, "runner", "getWork", json!({"types": "t"}))
        .await
        .is_ok());
    assert!(matches!(
        call(&server, "submitter", "getWork", json!({"types": "t"})).await,
        Err(ServerError::Unauthorized)
    ));

    // manager administers, worker does not
    assert!(call(&server, "operator", "jobPause", json!({"ids": []}))
        .await
        .is_ok());
    assert!(matches!(
        call(&server, "runner", "jobCancel", json!({"ids": []})).await,
        Err(ServerError::Unauthorized)
    ));

    // only admin starts and stops flow
    assert!(call(&server, "root", "startJobs", json!({})).await.is_ok());
    assert!(matches!(
        call(&server, "operator", "startJobs", json!({})).await,
        Err(ServerError::Unauthorized)
    ));
}

#[tokio::test]
async fn test_admin_reaches_every_method() {
    let server = server();

    assert!(call(&server, "root", "startJobs", json!({})).await.is_ok());
    assert!(call(&server, "root", "jobSave", json!({"doc": {"type": "t"}}))
        .await
        .is_ok());
    assert!(call(&server, "root", "getWork", json!({"types": "t"}))
        .await
        .is_ok());
    assert!(call(&server, "root", "jobPause", json!({"ids": []}))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_rejected_call_mutates_nothing() {
    let server = server();

    let id = call(&server, "submitter", "jobSave", json!({"doc": {"type": "t"}}))
        .await
        .unwrap();

    let denied = call(&server, "runner", "jobCancel", json!({"ids": id})).await;
    assert!(matches!(denied, Err(ServerError::Unauthorized)));

    let doc = call(&server, "root", "getJob", json!({"ids": id}))
        .await
        .unwrap();
    assert_eq!(doc["status"], json!("waiting"));
}

#[tokio::test]
async fn test_deny_rule_beats_role_allow() {
    let mut gate = role_gate();
    gate.deny(Scope::method("jobRemove"), AccessRule::identity("operator"));
    let server = Arc::new(JobServer::with_gate(
        Arc::new(MemoryStore::new()),
        gate,
        ServerConfig::default(),
    ));

    assert!(matches!(
        call(&server, "operator", "jobRemove", json!({"ids": []})).await,
        Err(ServerError::Unauthorized)
    ));
    // other manager methods still work
    assert!(call(&server, "operator", "jobPause", json!({"ids": []}))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_journal_format_and_order() {
    let server = server();
    let journal = Arc::new(MemoryCallLog::new());
    server.install_call_log(journal.clone()).unwrap();

    call(&server, "submitter", "jobSave", json!({"doc": {"type": "t"}}))
        .await
        .unwrap();
    let _ = call(&server, "runner", "startJobs", json!({})).await;

    let lines = journal.lines();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].contains("submitter, jobSave, params:"));
    assert!(lines[1].contains("returned:"));
    assert!(lines[2].contains("runner, startJobs"));
    assert_eq!(lines[3], "UNAUTHORIZED.");
}
