//! Compile job record linking a job, a source revision, and a build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of the source repository state at compile time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RevisionInformation {
    /// Commit the working tree pointed at, or `untracked`.
    pub commit_sha: String,
    /// Upstream commit the local branch tracked, when known.
    pub origin_commit_sha: Option<String>,
}

/// A completed deployment: created only when compile and validation succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CompileJob {
    /// Unique record identifier.
    pub id: String,
    /// The job whose operation produced this build.
    pub job_id: String,
    /// Source revision the build was compiled from.
    pub revision: RevisionInformation,
    /// Directory holding the compiled build.
    pub output_dir: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CompileJob {
    /// Construct a record for a successful deployment.
    #[must_use]
    pub fn new(job_id: String, revision: RevisionInformation, output_dir: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id,
            revision,
            output_dir,
            created_at: Utc::now(),
        }
    }
}
