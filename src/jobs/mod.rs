//! Bounded-concurrency scheduler for long-running operations.
//!
//! Jobs are admitted with [`JobManager::register_operation`], which
//! returns once the operation is scheduled — completion is observed via
//! status polling. A semaphore bounds concurrency without ever
//! serializing unrelated jobs against each other. Cancellation is
//! cooperative: the manager fires the job's token and the operation is
//! expected to observe it and exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::job::{Job, JobStatus};
use crate::persistence::job_repo::JobRepo;
use crate::rights::Rights;
use crate::{AppError, Result};

/// Poll interval for [`JobManager::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The work bound to a job: an async operation receiving the job's
/// context and returning its outcome.
pub type JobOperation = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<()>> + Send>;

/// Context handed to a running operation.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Identifier of the job the operation is bound to.
    pub job_id: String,
    /// Cancel signal the operation must observe.
    pub cancel: CancellationToken,
}

/// Book-keeping for one admitted, not-yet-terminal job.
struct RunningJob {
    cancel: CancellationToken,
}

/// Admits jobs and executes their operations on a bounded worker pool.
pub struct JobManager {
    repo: JobRepo,
    semaphore: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<String, RunningJob>>>,
}

impl JobManager {
    /// Create a manager executing at most `max_concurrent` operations at
    /// once.
    #[must_use]
    pub fn new(repo: JobRepo, max_concurrent: u32) -> Self {
        Self {
            repo,
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit a job and schedule its operation.
    ///
    /// Returns once the job is persisted and the worker is spawned, not
    /// once the operation finishes. Exceptions inside the operation are
    /// captured onto the job's error text, never propagated here.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if a job with this id is already
    /// admitted, or `AppError::Db` if persistence fails.
    pub async fn register_operation(
        &self,
        job: Job,
        operation: JobOperation,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        let job_cancel = cancel.child_token();

        {
            let mut running = self.running.lock().await;
            if running.contains_key(&job.id) {
                return Err(AppError::Conflict(format!(
                    "job {} is already admitted",
                    job.id
                )));
            }
            running.insert(
                job.id.clone(),
                RunningJob {
                    cancel: job_cancel.clone(),
                },
            );
        }

        if let Err(err) = self.repo.create(&job).await {
            self.running.lock().await.remove(&job.id);
            return Err(err);
        }

        let repo = self.repo.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let running = Arc::clone(&self.running);
        let job_id = job.id.clone();
        let span = info_span!("job", job_id = %job.id, description = %job.description);

        tokio::spawn(
            async move {
                run_job(&repo, &semaphore, operation, &job_id, job_cancel).await;
                running.lock().await.remove(&job_id);
            }
            .instrument(span),
        );

        info!(job_id = %job.id, "job admitted");
        Ok(job)
    }

    /// Request cooperative cancellation of a job.
    ///
    /// The caller must hold the job's recorded cancel right; the check
    /// happens before any state changes. The operation is expected to
    /// observe the signal and exit — nothing is force-terminated.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` — no such job.
    /// - `AppError::Unauthorized` — caller lacks the recorded right; the
    ///   job's status is unchanged.
    /// - `AppError::Conflict` — the job is already terminal.
    pub async fn cancel_job(&self, job_id: &str, caller: Rights) -> Result<Job> {
        let job = self
            .repo
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))?;

        caller.ensure(Rights(job.cancel_right), "cancel this job")?;

        if job.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "job {job_id} already finished"
            )));
        }

        let updated = self
            .repo
            .update_status(job_id, JobStatus::Cancelling, None)
            .await?;

        if let Some(entry) = self.running.lock().await.get(job_id) {
            entry.cancel.cancel();
        }

        info!(job_id, "job cancellation requested");
        Ok(updated)
    }

    /// Read a job's current state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the job does not exist.
    pub async fn status(&self, job_id: &str) -> Result<Job> {
        self.repo
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))
    }

    /// Await a job reaching a terminal status and return it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the job does not exist.
    pub async fn wait(&self, job_id: &str) -> Result<Job> {
        loop {
            let job = self.status(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Fire the cancel signal of every admitted job. Used at shutdown.
    pub async fn cancel_all(&self) {
        let running = self.running.lock().await;
        for (job_id, entry) in running.iter() {
            info!(job_id, "cancelling job for shutdown");
            entry.cancel.cancel();
        }
    }
}

/// Execute one job operation, recording its terminal status exactly once.
async fn run_job(
    repo: &JobRepo,
    semaphore: &Semaphore,
    operation: JobOperation,
    job_id: &str,
    cancel: CancellationToken,
) {
    // A closed semaphore cannot happen (it is never closed); a failed
    // acquire only means shutdown, which the cancel token also covers.
    let permit = tokio::select! {
        permit = semaphore.acquire() => permit.ok(),
        () = cancel.cancelled() => None,
    };

    // Hold the permit for the whole operation to keep the slot occupied.
    let Some(_permit) = permit else {
        record_cancelled(repo, job_id).await;
        return;
    };

    if cancel.is_cancelled() {
        record_cancelled(repo, job_id).await;
        return;
    }

    if let Err(err) = repo.update_status(job_id, JobStatus::Running, None).await {
        warn!(job_id, %err, "failed to mark job running");
        return;
    }

    let context = JobContext {
        job_id: job_id.to_owned(),
        cancel: cancel.clone(),
    };

    match operation(context).await {
        Ok(()) => {
            info!(job_id, "job completed");
            if let Err(err) = repo
                .update_status(job_id, JobStatus::Completed, None)
                .await
            {
                warn!(job_id, %err, "failed to mark job completed");
            }
        }
        Err(AppError::Cancelled(msg)) => {
            info!(job_id, reason = %msg, "job observed cancellation");
            record_cancelled(repo, job_id).await;
        }
        Err(err) => {
            warn!(job_id, %err, "job errored");
            if let Err(err) = repo
                .update_status(job_id, JobStatus::Errored, Some(err.to_string()))
                .await
            {
                warn!(job_id, %err, "failed to mark job errored");
            }
        }
    }
}

/// Move a job to `Cancelled`, inserting the `Cancelling` step when the
/// cancel arrived through the token rather than [`JobManager::cancel_job`].
async fn record_cancelled(repo: &JobRepo, job_id: &str) {
    match repo.get_by_id(job_id).await {
        Ok(Some(job)) if job.status != JobStatus::Cancelling => {
            if let Err(err) = repo
                .update_status(job_id, JobStatus::Cancelling, None)
                .await
            {
                warn!(job_id, %err, "failed to mark job cancelling");
                return;
            }
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(job_id, "job vanished before cancellation could be recorded");
            return;
        }
        Err(err) => {
            warn!(job_id, %err, "failed to read job during cancellation");
            return;
        }
    }

    if let Err(err) = repo
        .update_status(job_id, JobStatus::Cancelled, None)
        .await
    {
        warn!(job_id, %err, "failed to mark job cancelled");
    }
}
