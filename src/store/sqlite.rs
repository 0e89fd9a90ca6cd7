//! SQLite store implementation.
//!
//! Persistent backend storing one row per job: the full document as JSON
//! plus extracted columns for indexed filtering. Writes serialize through a
//! single guard and re-assert the status precondition in the UPDATE's WHERE
//! clause, so conditional updates keep their per-document CAS semantics.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

use super::{project, JobMutation, JobQuery, JobStore, Projection, StoreError};
use crate::core::job::{JobDoc, JobStatus};
use crate::core::types::JobId;

/// SQLite store backend.
pub struct SqliteStore {
    pool: SqlitePool,
    // Serializes the read-modify-write cycle of conditional updates.
    write_guard: Mutex<()>,
}

impl SqliteStore {
    /// Create a new SQLite store with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self {
            pool,
            write_guard: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self {
            pool,
            write_guard: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fetch candidate rows using the indexable filters, then apply the full
    /// query in memory. The remaining filters (dependency contents, data
    /// equality) live only in the JSON document.
    async fn candidates(&self, query: &JobQuery) -> Result<Vec<JobDoc>, StoreError> {
        let mut sql = String::from("SELECT doc FROM jobs WHERE 1=1");
        let mut status_list = Vec::new();
        if let Some(statuses) = &query.statuses {
            status_list = statuses.iter().map(JobStatus::as_str).collect::<Vec<_>>();
            let marks = vec!["?"; status_list.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", marks));
        }
        let mut type_list = Vec::new();
        if let Some(types) = &query.types {
            type_list = types.clone();
            let marks = vec!["?"; type_list.len()].join(", ");
            sql.push_str(&format!(" AND job_type IN ({})", marks));
        }
        if query.after_at_or_before.is_some() {
            sql.push_str(" AND after_ms <= ?");
        }
        if query.repeats_forever == Some(true) {
            sql.push_str(" AND repeats_forever = 1");
        }

        let mut q = sqlx::query_as::<_, (String,)>(&sql);
        for status in &status_list {
            q = q.bind(*status);
        }
        for job_type in &type_list {
            q = q.bind(job_type.clone());
        }
        if let Some(at) = &query.after_at_or_before {
            q = q.bind(at.timestamp_millis());
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut docs = Vec::new();
        for (json,) in rows {
            let doc: JobDoc = serde_json::from_str(&json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            if query.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Write a mutated document back, keyed on id and expected status so a
    /// raced status change leaves the row untouched.
    async fn write_back(&self, doc: &JobDoc, expected: JobStatus) -> Result<bool, StoreError> {
        let json = serde_json::to_string(doc)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, priority = ?, after_ms = ?, updated_ms = ?,
                run_id = ?, repeats_forever = ?, doc = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(doc.status.as_str())
        .bind(doc.priority)
        .bind(doc.after.timestamp_millis())
        .bind(doc.updated.timestamp_millis())
        .bind(doc.run_id.map(|r| r.to_string()))
        .bind(doc.repeats.is_forever())
        .bind(json)
        .bind(doc.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, doc: JobDoc) -> Result<JobId, StoreError> {
        let _guard = self.write_guard.lock().await;
        let json = serde_json::to_string(&doc)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (id, job_type, status, priority, after_ms, updated_ms, run_id, repeats_forever, doc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc.id.to_string())
        .bind(&doc.job_type)
        .bind(doc.status.as_str())
        .bind(doc.priority)
        .bind(doc.after.timestamp_millis())
        .bind(doc.updated.timestamp_millis())
        .bind(doc.run_id.map(|r| r.to_string()))
        .bind(doc.repeats.is_forever())
        .bind(json)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(doc.id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateId(doc.id))
            }
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    async fn find_one(&self, query: &JobQuery) -> Result<Option<JobDoc>, StoreError> {
        Ok(self.candidates(query).await?.into_iter().next())
    }

    async fn find(
        &self,
        query: &JobQuery,
        projection: Projection,
    ) -> Result<Vec<JobDoc>, StoreError> {
        Ok(self
            .candidates(query)
            .await?
            .into_iter()
            .map(|doc| project(doc, projection))
            .collect())
    }

    async fn update(
        &self,
        query: &JobQuery,
        mutation: &JobMutation,
        multi: bool,
    ) -> Result<usize, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut count = 0;
        for mut doc in self.candidates(query).await? {
            let expected = doc.status;
            mutation.apply(&mut doc);
            if self.write_back(&doc, expected).await? {
                count += 1;
            }
            if !multi && count == 1 {
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
        let _guard = self.write_guard.lock().await;
        for doc in self.candidates(query).await? {
            let previous = doc.clone();
            let mut mutated = doc;
            let expected = mutated.status;
            mutation.apply(&mut mutated);
            if self.write_back(&mutated, expected).await? {
                return Ok(Some(previous));
            }
        }
        Ok(None)
    }

    async fn remove(&self, query: &JobQuery) -> Result<usize, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut count = 0;
        for doc in self.candidates(query).await? {
            let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND status = ?")
                .bind(doc.id.to_string())
                .bind(doc.status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            count += result.rows_affected() as usize;
        }
        Ok(count)
    }
}
