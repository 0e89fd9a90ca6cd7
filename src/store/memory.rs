//! In-memory store implementation.
//!
//! Thread-safe backend for testing and single-process deployments. All
//! mutation paths take the write lock for the full match-and-apply step, so
//! conditional updates are atomic per document (and, incidentally, across
//! the whole map). Data is not persisted across restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{project, JobMutation, JobQuery, JobStore, Projection, StoreError};
use crate::core::job::JobDoc;
use crate::core::types::JobId;

/// In-memory store backend.
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, JobDoc>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of documents currently stored.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    /// Whether the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, doc: JobDoc) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        if jobs.contains_key(&doc.id) {
            return Err(StoreError::DuplicateId(doc.id));
        }
        let id = doc.id;
        jobs.insert(id, doc);
        Ok(id)
    }

    async fn find_one(&self, query: &JobQuery) -> Result<Option<JobDoc>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs.values().find(|doc| query.matches(doc)).cloned())
    }

    async fn find(
        &self,
        query: &JobQuery,
        projection: Projection,
    ) -> Result<Vec<JobDoc>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .map(|doc| project(doc, projection))
            .collect())
    }

    async fn update(
        &self,
        query: &JobQuery,
        mutation: &JobMutation,
        multi: bool,
    ) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut count = 0;
        for doc in jobs.values_mut() {
            if !query.matches(doc) {
                continue;
            }
            mutation.apply(doc);
            count += 1;
            if !multi {
                break;
            }
        }
        Ok(count)
    }

    async fn find_and_modify(
        &self,
        query: &JobQuery,
        mutation: &JobMutation,
    ) -> Result<Option<JobDoc>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        for doc in jobs.values_mut() {
            if query.matches(doc) {
                let previous = doc.clone();
                mutation.apply(doc);
                return Ok(Some(previous));
            }
        }
        Ok(None)
    }

    async fn remove(&self, query: &JobQuery) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        let before = jobs.len();
        jobs.retain(|_, doc| !query.matches(doc));
        Ok(before - jobs.len())
    }
}
