//! Job model and status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rights::Rights;

/// Lifecycle status for a scheduled job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted but not yet picked up by the worker pool.
    Pending,
    /// Operation executing on the worker pool.
    Running,
    /// Operation finished without error.
    Completed,
    /// Operation failed; diagnostics captured on the job.
    Errored,
    /// Cancel requested; operation has not yet observed the signal.
    Cancelling,
    /// Operation observed the cancel signal and exited.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// A long-running operation admitted to the job manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// Unique record identifier.
    pub id: String,
    /// Human-readable description of the operation.
    pub description: String,
    /// Identity of the caller that admitted the job.
    pub started_by: String,
    /// Right a caller must hold to cancel this job.
    pub cancel_right: u64,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Admission timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp the operation began executing.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp the job reached a terminal status.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Diagnostic text captured when the operation failed.
    pub error_text: Option<String>,
}

impl Job {
    /// Construct a new pending job with a generated identifier.
    #[must_use]
    pub fn new(description: String, started_by: String, cancel_right: Rights) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description,
            started_by,
            cancel_right: cancel_right.0,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error_text: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self.status, next),
            (JobStatus::Pending, JobStatus::Running | JobStatus::Cancelling)
                | (
                    JobStatus::Running,
                    JobStatus::Completed | JobStatus::Errored | JobStatus::Cancelling
                )
                | (
                    JobStatus::Cancelling,
                    JobStatus::Cancelled | JobStatus::Completed | JobStatus::Errored
                )
        )
    }
}
