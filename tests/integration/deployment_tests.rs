//! Integration tests for the deployment pipeline: compile, validation
//! handshake, compile job records, and cancellation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use world_warden::models::job::JobStatus;
use world_warden::models::settings::SettingsUpdate;
use world_warden::persistence::compile_job_repo::CompileJobRepo;
use world_warden::rights::{Rights, DEPLOY_CANCEL_COMPILE, DEPLOY_READ};
use world_warden::AppError;

use super::test_helpers::{build_stack, stub_binary, test_config, wait_for_status, Stack};
use world_warden::watchdog::WatchdogStatus;

const ALL_RIGHTS: Rights = Rights(u64::MAX);

/// Stack whose compiler copies the repository into the output directory.
async fn deploy_stack(binary: &str) -> (Stack, tempfile::TempDir, tempfile::TempDir) {
    let data = tempfile::tempdir().expect("tempdir");
    let repo = tempfile::tempdir().expect("tempdir");
    std::fs::write(repo.path().join("world.dme"), b"world source").expect("write");

    let mut config = test_config(data.path(), repo.path(), binary, &[]);
    config.deploy.compiler_program = "sh".into();
    config.deploy.compiler_args = vec!["-c".into(), "cp -r {source}/. {output}/".into()];

    (build_stack(config).await, data, repo)
}

#[tokio::test]
async fn create_requires_the_compile_right() {
    let (stack, _data, _repo) = deploy_stack("sleep").await;

    let err = stack
        .pipeline
        .create("tester", DEPLOY_READ, &CancellationToken::new())
        .await
        .expect_err("must be denied");
    assert!(matches!(err, AppError::Unauthorized(_)));
}

#[tokio::test]
async fn failed_compile_marks_the_job_errored_without_a_compile_job() {
    let (stack, _data, _repo) = deploy_stack("sleep").await;
    // A compiler that writes diagnostics and fails.
    let mut config = (*stack.config).clone();
    config.deploy.compiler_args = vec!["-c".into(), "echo build exploded >&2; exit 2".into()];
    let stack = build_stack(config).await;

    let job = stack
        .pipeline
        .create("tester", ALL_RIGHTS, &CancellationToken::new())
        .await
        .expect("admitted");

    let finished = tokio::time::timeout(Duration::from_secs(20), stack.jobs.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");

    assert_eq!(finished.status, JobStatus::Errored);
    let diagnostics = finished.error_text.expect("diagnostics captured");
    assert!(diagnostics.contains("build exploded"), "{diagnostics}");

    let compile_jobs = CompileJobRepo::new(std::sync::Arc::clone(&stack.db));
    assert!(
        compile_jobs
            .get_by_job_id(&job.id)
            .await
            .expect("query")
            .is_none(),
        "no compile job may exist for a failed deployment"
    );

    // A status read returns the captured diagnostic text.
    let read_back = stack.jobs.status(&job.id).await.expect("status");
    assert!(read_back.error_text.expect("text").contains("build exploded"));
}

#[tokio::test]
async fn successful_deployment_without_validation_records_a_compile_job() {
    let (stack, _data, _repo) = deploy_stack("sleep").await;

    stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                require_api_validation: Some(false),
                ..SettingsUpdate::default()
            },
            ALL_RIGHTS,
        )
        .await
        .expect("settings update");

    let job = stack
        .pipeline
        .create("tester", ALL_RIGHTS, &CancellationToken::new())
        .await
        .expect("admitted");

    let finished = tokio::time::timeout(Duration::from_secs(20), stack.jobs.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");
    assert_eq!(finished.status, JobStatus::Completed, "{:?}", finished.error_text);

    let compile_jobs = CompileJobRepo::new(std::sync::Arc::clone(&stack.db));
    let record = compile_jobs
        .get_by_job_id(&job.id)
        .await
        .expect("query")
        .expect("compile job exists");

    // The tempdir repository is not a git checkout.
    assert_eq!(record.revision.commit_sha, "untracked");
    assert!(std::path::Path::new(&record.output_dir).join("world.dme").exists());

    let fetched = stack
        .pipeline
        .compile_job(&record.id, ALL_RIGHTS)
        .await
        .expect("fetch");
    assert_eq!(fetched.id, record.id);
}

#[tokio::test]
async fn validation_handshake_failure_marks_the_job_errored() {
    // The "game" crashes instantly, so the throwaway session never
    // becomes ready.
    let (stack, _data, _repo) = deploy_stack("false").await;

    let job = stack
        .pipeline
        .create("tester", ALL_RIGHTS, &CancellationToken::new())
        .await
        .expect("admitted");

    let finished = tokio::time::timeout(Duration::from_secs(30), stack.jobs.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");

    assert_eq!(finished.status, JobStatus::Errored);
    assert!(finished.error_text.expect("diagnostics").contains("compile"));

    let compile_jobs = CompileJobRepo::new(std::sync::Arc::clone(&stack.db));
    assert!(compile_jobs
        .get_by_job_id(&job.id)
        .await
        .expect("query")
        .is_none());
}

#[tokio::test]
async fn validated_deployment_reaches_the_watchdog_and_goes_live() {
    let (stack, _data, _repo) = deploy_stack(&stub_binary()).await;

    let cancel = CancellationToken::new();
    let watchdog = std::sync::Arc::clone(&stack.watchdog);
    let loop_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = watchdog.run(loop_cancel).await;
    });

    let job = stack
        .pipeline
        .create("tester", ALL_RIGHTS, &cancel)
        .await
        .expect("admitted");

    let finished = tokio::time::timeout(Duration::from_secs(30), stack.jobs.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");
    assert_eq!(finished.status, JobStatus::Completed, "{:?}", finished.error_text);

    // The watchdog received the provider and launched it.
    wait_for_status(&stack.watchdog, WatchdogStatus::Running, 20).await;
    assert!(stack.watchdog.primary_pid().await.is_some());

    cancel.cancel();
    stack.watchdog.shutdown().await;
}

#[tokio::test]
async fn deployment_cancel_is_cooperative_mid_compile() {
    let (stack, _data, _repo) = deploy_stack("sleep").await;
    let mut config = (*stack.config).clone();
    config.deploy.compiler_args = vec!["-c".into(), "sleep 30".into()];
    let stack = build_stack(config).await;

    let job = stack
        .pipeline
        .create("tester", ALL_RIGHTS, &CancellationToken::new())
        .await
        .expect("admitted");

    // Let the compile start, then cancel with the recorded right.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if stack.jobs.status(&job.id).await.expect("status").status == JobStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("compile started");

    stack
        .jobs
        .cancel_job(&job.id, DEPLOY_CANCEL_COMPILE)
        .await
        .expect("cancel");

    let finished = tokio::time::timeout(Duration::from_secs(10), stack.jobs.wait(&job.id))
        .await
        .expect("in time")
        .expect("wait");
    assert_eq!(finished.status, JobStatus::Cancelled);
}
