//! Integration tests for the job scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Barrier, Notify};
use tokio_util::sync::CancellationToken;

use world_warden::jobs::JobManager;
use world_warden::models::job::{Job, JobStatus};
use world_warden::persistence::db;
use world_warden::persistence::job_repo::JobRepo;
use world_warden::rights::DEPLOY_CANCEL_COMPILE;
use world_warden::AppError;

use super::test_helpers::job_op;

async fn manager(max_concurrent: u32) -> JobManager {
    let pool = db::connect_memory().await.expect("db connect");
    JobManager::new(JobRepo::new(Arc::new(pool)), max_concurrent)
}

fn test_job(description: &str) -> Job {
    Job::new(description.into(), "tester".into(), DEPLOY_CANCEL_COMPILE)
}

#[tokio::test]
async fn registered_operation_runs_to_completion() {
    let manager = manager(2).await;
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let job = manager
        .register_operation(
            test_job("noop"),
            job_op(move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
            &CancellationToken::new(),
        )
        .await
        .expect("register");

    // Registration returns a pending/running job, not a finished one.
    assert!(!job.status.is_terminal());

    let finished = tokio::time::timeout(Duration::from_secs(5), manager.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished.started_at.is_some());
    assert!(finished.stopped_at.is_some());
    assert!(finished.error_text.is_none());
}

#[tokio::test]
async fn operation_errors_are_captured_not_propagated() {
    let manager = manager(2).await;

    let job = manager
        .register_operation(
            test_job("explodes"),
            job_op(|_ctx| async { Err(AppError::Compile("kaboom".into())) }),
            &CancellationToken::new(),
        )
        .await
        .expect("registration itself succeeds");

    let finished = tokio::time::timeout(Duration::from_secs(5), manager.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");

    assert_eq!(finished.status, JobStatus::Errored);
    assert_eq!(finished.error_text.as_deref(), Some("compile: kaboom"));
}

#[tokio::test]
async fn duplicate_admission_of_one_job_id_is_rejected() {
    let manager = manager(2).await;
    let gate = Arc::new(Notify::new());

    let job = test_job("held");
    let hold = Arc::clone(&gate);
    manager
        .register_operation(
            job.clone(),
            job_op(move |_ctx| async move {
                hold.notified().await;
                Ok(())
            }),
            &CancellationToken::new(),
        )
        .await
        .expect("first admission");

    let err = manager
        .register_operation(
            job.clone(),
            job_op(|_ctx| async { Ok(()) }),
            &CancellationToken::new(),
        )
        .await
        .expect_err("second admission must fail");
    assert!(matches!(err, AppError::Conflict(_)));

    gate.notify_one();
    let finished = tokio::time::timeout(Duration::from_secs(5), manager.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test]
async fn concurrency_cap_defers_excess_jobs_without_dropping_them() {
    let manager = manager(1).await;
    let gate = Arc::new(Notify::new());
    let second_ran = Arc::new(AtomicBool::new(false));

    let hold = Arc::clone(&gate);
    let first = manager
        .register_operation(
            test_job("first"),
            job_op(move |_ctx| async move {
                hold.notified().await;
                Ok(())
            }),
            &CancellationToken::new(),
        )
        .await
        .expect("first");

    let flag = Arc::clone(&second_ran);
    let second = manager
        .register_operation(
            test_job("second"),
            job_op(move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
            &CancellationToken::new(),
        )
        .await
        .expect("second");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !second_ran.load(Ordering::SeqCst),
        "second job must wait for the only slot"
    );
    assert_eq!(
        manager.status(&second.id).await.expect("status").status,
        JobStatus::Pending
    );

    gate.notify_one();

    for id in [&first.id, &second.id] {
        let finished = tokio::time::timeout(Duration::from_secs(5), manager.wait(id))
            .await
            .expect("in time")
            .expect("wait");
        assert_eq!(finished.status, JobStatus::Completed);
    }
    assert!(second_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unrelated_jobs_run_concurrently() {
    let manager = manager(4).await;

    // Each operation waits for the other; serialized execution would
    // deadlock and trip the timeout.
    let barrier = Arc::new(Barrier::new(2));

    let mut ids = Vec::new();
    for name in ["left", "right"] {
        let rendezvous = Arc::clone(&barrier);
        let job = manager
            .register_operation(
                test_job(name),
                job_op(move |_ctx| async move {
                    rendezvous.wait().await;
                    Ok(())
                }),
                &CancellationToken::new(),
            )
            .await
            .expect("register");
        ids.push(job.id);
    }

    for id in &ids {
        let finished = tokio::time::timeout(Duration::from_secs(5), manager.wait(id))
            .await
            .expect("concurrent jobs must not serialize")
            .expect("wait");
        assert_eq!(finished.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn one_failing_job_does_not_disturb_another() {
    let manager = manager(4).await;

    let failing = manager
        .register_operation(
            test_job("failing"),
            job_op(|_ctx| async { Err(AppError::Compile("broken".into())) }),
            &CancellationToken::new(),
        )
        .await
        .expect("register");

    let healthy = manager
        .register_operation(
            test_job("healthy"),
            job_op(|_ctx| async { Ok(()) }),
            &CancellationToken::new(),
        )
        .await
        .expect("register");

    let failed = tokio::time::timeout(Duration::from_secs(5), manager.wait(&failing.id))
        .await
        .expect("in time")
        .expect("wait");
    let completed = tokio::time::timeout(Duration::from_secs(5), manager.wait(&healthy.id))
        .await
        .expect("in time")
        .expect("wait");

    assert_eq!(failed.status, JobStatus::Errored);
    assert_eq!(completed.status, JobStatus::Completed);
}

#[tokio::test]
async fn status_of_an_unknown_job_is_not_found() {
    let manager = manager(1).await;
    let err = manager.status("ghost").await.expect_err("must fail");
    assert!(matches!(err, AppError::NotFound(_)));
}
