//! Compile job repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::compile_job::{CompileJob, RevisionInformation};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for compile job records.
#[derive(Clone)]
pub struct CompileJobRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CompileJobRow {
    id: String,
    job_id: String,
    commit_sha: String,
    origin_commit_sha: Option<String>,
    output_dir: String,
    created_at: String,
}

impl CompileJobRow {
    /// Convert a database row into the domain model.
    fn into_compile_job(self) -> Result<CompileJob> {
        let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(CompileJob {
            id: self.id,
            job_id: self.job_id,
            revision: RevisionInformation {
                commit_sha: self.commit_sha,
                origin_commit_sha: self.origin_commit_sha,
            },
            output_dir: self.output_dir,
            created_at,
        })
    }
}

impl CompileJobRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new compile job record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, compile_job: &CompileJob) -> Result<CompileJob> {
        sqlx::query(
            "INSERT INTO compile_job (id, job_id, commit_sha, origin_commit_sha,
             output_dir, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&compile_job.id)
        .bind(&compile_job.job_id)
        .bind(&compile_job.revision.commit_sha)
        .bind(&compile_job.revision.origin_commit_sha)
        .bind(&compile_job.output_dir)
        .bind(compile_job.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(compile_job.clone())
    }

    /// Retrieve a compile job by identifier.
    ///
    /// Returns `Ok(None)` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<CompileJob>> {
        let row: Option<CompileJobRow> = sqlx::query_as("SELECT * FROM compile_job WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(CompileJobRow::into_compile_job).transpose()
    }

    /// Retrieve the compile job produced by a given job, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_job_id(&self, job_id: &str) -> Result<Option<CompileJob>> {
        let row: Option<CompileJobRow> =
            sqlx::query_as("SELECT * FROM compile_job WHERE job_id = ?1")
                .bind(job_id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(CompileJobRow::into_compile_job).transpose()
    }

    /// Retrieve the most recent successful deployment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest(&self) -> Result<Option<CompileJob>> {
        let row: Option<CompileJobRow> =
            sqlx::query_as("SELECT * FROM compile_job ORDER BY created_at DESC LIMIT 1")
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(CompileJobRow::into_compile_job).transpose()
    }
}
