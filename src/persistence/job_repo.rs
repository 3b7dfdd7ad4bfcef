//! Job repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::job::{Job, JobStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for job records.
#[derive(Clone)]
pub struct JobRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    description: String,
    started_by: String,
    cancel_right: i64,
    status: String,
    created_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    error_text: Option<String>,
}

impl JobRow {
    /// Convert a database row into the domain model.
    fn into_job(self) -> Result<Job> {
        let status = parse_job_status(&self.status)?;
        Ok(Job {
            id: self.id,
            description: self.description,
            started_by: self.started_by,
            #[allow(clippy::cast_sign_loss)]
            cancel_right: self.cancel_right as u64,
            status,
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            stopped_at: self.stopped_at.as_deref().map(parse_timestamp).transpose()?,
            error_text: self.error_text,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid timestamp: {e}")))
}

fn parse_job_status(s: &str) -> Result<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "errored" => Ok(JobStatus::Errored),
        "cancelling" => Ok(JobStatus::Cancelling),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(AppError::Db(format!("invalid job status: {other}"))),
    }
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Errored => "errored",
        JobStatus::Cancelling => "cancelling",
        JobStatus::Cancelled => "cancelled",
    }
}

impl JobRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new job record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, job: &Job) -> Result<Job> {
        #[allow(clippy::cast_possible_wrap)]
        let cancel_right = job.cancel_right as i64;

        sqlx::query(
            "INSERT INTO job (id, description, started_by, cancel_right, status,
             created_at, started_at, stopped_at, error_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&job.id)
        .bind(&job.description)
        .bind(&job.started_by)
        .bind(cancel_right)
        .bind(job_status_str(job.status))
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|ts| ts.to_rfc3339()))
        .bind(job.stopped_at.map(|ts| ts.to_rfc3339()))
        .bind(&job.error_text)
        .execute(self.db.as_ref())
        .await?;

        Ok(job.clone())
    }

    /// Retrieve a job by identifier.
    ///
    /// Returns `Ok(None)` if the job does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM job WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(JobRow::into_job).transpose()
    }

    /// Transition a job to a new status, stamping lifecycle timestamps.
    ///
    /// Moving to `Running` records `started_at`; any terminal status
    /// records `stopped_at` and the optional error text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the job does not exist and
    /// `AppError::Conflict` if the transition violates the status machine.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        error_text: Option<String>,
    ) -> Result<Job> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))?;

        if !current.can_transition_to(status) {
            return Err(AppError::Conflict(format!(
                "job {id} cannot move from {} to {}",
                job_status_str(current.status),
                job_status_str(status)
            )));
        }

        let now = Utc::now();
        current.status = status;
        if status == JobStatus::Running {
            current.started_at = Some(now);
        }
        if status.is_terminal() {
            current.stopped_at = Some(now);
            current.error_text = error_text.clone();
        }

        sqlx::query(
            "UPDATE job SET status = ?1, started_at = ?2, stopped_at = ?3, error_text = ?4
             WHERE id = ?5",
        )
        .bind(job_status_str(status))
        .bind(current.started_at.map(|ts| ts.to_rfc3339()))
        .bind(current.stopped_at.map(|ts| ts.to_rfc3339()))
        .bind(&current.error_text)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(current)
    }

    /// Mark every non-terminal job as errored.
    ///
    /// Called once at startup: jobs left `pending`/`running`/`cancelling`
    /// by a crashed host can never complete.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail_orphaned(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job SET status = 'errored', stopped_at = ?1,
             error_text = 'host restarted while the job was in flight'
             WHERE status IN ('pending', 'running', 'cancelling')",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }
}
