//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use quarry::testing::TestServer;
use quarry::{GetWorkOptions, JobDoc, JobId, RunId};
use serde_json::json;

/// Save an immediately-eligible job of the given type and promote it to
/// ready.
pub async fn ready_job(harness: &TestServer, job_type: &str) -> JobId {
    let id = harness
        .save(JobDoc::new(job_type, json!({})))
        .await
        .expect("save job");
    harness.promote().await;
    id
}

/// Claim one job of the given type directly through the server, returning
/// its id and the minted run id.
pub async fn claim_one(harness: &TestServer, job_type: &str) -> (JobId, RunId) {
    let jobs = harness
        .server
        .get_work(&[job_type.to_string()], GetWorkOptions::default())
        .await
        .expect("getWork");
    assert_eq!(jobs.len(), 1, "expected exactly one claimable job");
    (jobs[0].id, jobs[0].run_id.expect("running job has a run id"))
}
