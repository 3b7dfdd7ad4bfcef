//! Deployment pipeline: compiles the repository into a new build,
//! validates it with a throwaway session, records the compile job, and
//! hands the build to the watchdog.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::jobs::{JobContext, JobManager};
use crate::models::compile_job::{CompileJob, RevisionInformation};
use crate::models::job::Job;
use crate::models::settings::{DeploySettings, SettingsUpdate};
use crate::persistence::compile_job_repo::CompileJobRepo;
use crate::persistence::db::Database;
use crate::persistence::settings_repo::SettingsRepo;
use crate::rights::{
    required_right, Rights, SettingsField, DEPLOY_CANCEL_COMPILE, DEPLOY_COMPILE, DEPLOY_READ,
};
use crate::session::{ApiValidationStatus, DmbProvider, LaunchSpec, SessionController};
use crate::watchdog::Watchdog;
use crate::{AppError, Result};

/// Bytes of compiler stderr preserved on a failed deployment.
const DIAGNOSTIC_TAIL_BYTES: usize = 4096;

/// Builds and registers deployment jobs and manages deploy settings.
pub struct DeploymentPipeline {
    config: Arc<GlobalConfig>,
    jobs: Arc<JobManager>,
    watchdog: Arc<Watchdog>,
    compile_job_repo: CompileJobRepo,
    settings_repo: SettingsRepo,
}

impl DeploymentPipeline {
    /// Create the pipeline over shared collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        jobs: Arc<JobManager>,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        Self {
            config,
            jobs,
            watchdog,
            compile_job_repo: CompileJobRepo::new(Arc::clone(&db)),
            settings_repo: SettingsRepo::new(db),
        }
    }

    /// Begin deploying repository code.
    ///
    /// Builds a job wrapping the compile operation, registers it, and
    /// returns the accepted job immediately; completion is observed via
    /// job status. Failures inside the operation land on the job's error
    /// text, and no compile job record is created for them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` if `caller` lacks the compile
    /// right, or `AppError::Db` if admission fails.
    pub async fn create(
        &self,
        started_by: &str,
        caller: Rights,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        caller.ensure(DEPLOY_COMPILE, "start a deployment")?;

        let job = Job::new(
            "Compile active repository code".into(),
            started_by.to_owned(),
            DEPLOY_CANCEL_COMPILE,
        );

        let config = Arc::clone(&self.config);
        let watchdog = Arc::clone(&self.watchdog);
        let compile_job_repo = self.compile_job_repo.clone();
        let settings_repo = self.settings_repo.clone();

        let operation = Box::new(
            move |ctx: JobContext| -> futures_util::future::BoxFuture<'static, Result<()>> {
                Box::pin(run_deployment(
                    config,
                    watchdog,
                    compile_job_repo,
                    settings_repo,
                    ctx,
                ))
            },
        );

        self.jobs.register_operation(job, operation, cancel).await
    }

    /// Read the current deploy settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` without the read right, or
    /// `AppError::NotFound` if the settings row is gone.
    pub async fn read_settings(&self, caller: Rights) -> Result<DeploySettings> {
        caller.ensure(DEPLOY_READ, "read deploy settings")?;
        self.settings_repo
            .get()
            .await?
            .ok_or_else(|| AppError::NotFound("deploy settings not found".into()))
    }

    /// Read a compile job record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` without the read right, or
    /// `AppError::NotFound` for an unknown id.
    pub async fn compile_job(&self, id: &str, caller: Rights) -> Result<CompileJob> {
        caller.ensure(DEPLOY_READ, "read compile jobs")?;
        self.compile_job_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("compile job {id} not found")))
    }

    /// Update deploy settings, authorizing each mutated field against
    /// its own right.
    ///
    /// Malformed values are rejected before any persisted state is
    /// touched.
    ///
    /// # Errors
    ///
    /// - `AppError::Invalid` — zero validation port or unsupported
    ///   security level.
    /// - `AppError::Unauthorized` — a mutated field's right is missing.
    /// - `AppError::Conflict` — the settings row was concurrently
    ///   removed.
    pub async fn update_settings(
        &self,
        update: SettingsUpdate,
        caller: Rights,
    ) -> Result<DeploySettings> {
        update.validate()?;

        for (field, mutated) in [
            (SettingsField::ProjectName, update.project_name.is_some()),
            (
                SettingsField::ValidationPort,
                update.validation_port.is_some(),
            ),
            (
                SettingsField::SecurityLevel,
                update.validation_security.is_some(),
            ),
            (
                SettingsField::RequireApiValidation,
                update.require_api_validation.is_some(),
            ),
        ] {
            if mutated {
                caller.ensure(required_right(field), "change this deploy setting")?;
            }
        }

        let mut settings = self.settings_repo.get().await?.ok_or_else(|| {
            AppError::Conflict("deployment settings were concurrently removed".into())
        })?;

        if let Some(project_name) = update.project_name {
            settings.project_name = if project_name.is_empty() {
                None
            } else {
                Some(project_name)
            };
        }
        if let Some(port) = update.validation_port {
            settings.validation_port = port;
        }
        if let Some(level) = update.validation_security {
            settings.validation_security = level;
        }
        if let Some(required) = update.require_api_validation {
            settings.require_api_validation = required;
        }

        self.settings_repo.save(&settings).await?;
        info!("deploy settings updated");
        Ok(settings)
    }
}

/// The compile operation bound to a deployment job.
async fn run_deployment(
    config: Arc<GlobalConfig>,
    watchdog: Arc<Watchdog>,
    compile_job_repo: CompileJobRepo,
    settings_repo: SettingsRepo,
    ctx: JobContext,
) -> Result<()> {
    let settings = settings_repo.get().await?.ok_or_else(|| {
        AppError::Conflict("deployment settings were concurrently removed".into())
    })?;

    let revision = snapshot_revision(&config.deploy.repository_dir).await;
    info!(commit = %revision.commit_sha, "deploying repository revision");

    let output_dir = config.deployments_dir().join(&ctx.job_id);
    tokio::fs::create_dir_all(&output_dir)
        .await
        .map_err(|err| AppError::Io(format!("cannot create deployment dir: {err}")))?;

    compile(&config, &settings, &output_dir, &ctx).await?;

    let provider = Arc::new(DmbProvider::from_directory(&output_dir)?);

    if settings.require_api_validation {
        validate_build(&config, &settings, Arc::clone(&provider), &ctx).await?;
    } else {
        info!("api validation disabled by settings; skipping handshake");
    }

    let compile_job = CompileJob::new(
        ctx.job_id.clone(),
        revision,
        output_dir.display().to_string(),
    );
    compile_job_repo.create(&compile_job).await?;

    watchdog.queue_deployment(provider).await?;
    info!(compile_job_id = %compile_job.id, "deployment recorded and queued for promotion");
    Ok(())
}

/// Invoke the external compiler, capturing its stderr for diagnostics.
async fn compile(
    config: &GlobalConfig,
    settings: &DeploySettings,
    output_dir: &Path,
    ctx: &JobContext,
) -> Result<()> {
    let source = config.deploy.repository_dir.display().to_string();
    let output = output_dir.display().to_string();

    let mut command = tokio::process::Command::new(&config.deploy.compiler_program);
    for arg in &config.deploy.compiler_args {
        command.arg(arg.replace("{source}", &source).replace("{output}", &output));
    }
    if let Some(project) = &settings.project_name {
        command.arg(project);
    }
    command
        .current_dir(&config.deploy.repository_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|err| AppError::Compile(format!("cannot spawn compiler: {err}")))?;

    let stderr = child.stderr.take();
    let collector = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buffer).await;
        }
        buffer
    });

    let status = tokio::select! {
        status = child.wait() => Some(status),
        () = ctx.cancel.cancelled() => None,
    };

    let Some(status) = status else {
        child.kill().await.ok();
        return Err(AppError::Cancelled("deployment cancelled mid-compile".into()));
    };

    let status = status.map_err(|err| AppError::Compile(format!("compiler wait failed: {err}")))?;
    let diagnostics = collector.await.unwrap_or_default();

    if status.success() {
        Ok(())
    } else {
        let tail_start = diagnostics.len().saturating_sub(DIAGNOSTIC_TAIL_BYTES);
        let tail = String::from_utf8_lossy(&diagnostics[tail_start..]);
        Err(AppError::Compile(format!(
            "compiler exited with {status}: {tail}"
        )))
    }
}

/// Validate a fresh build by launching a throwaway session against it
/// and exchanging one protocol round trip.
async fn validate_build(
    config: &GlobalConfig,
    settings: &DeploySettings,
    provider: Arc<DmbProvider>,
    ctx: &JobContext,
) -> Result<()> {
    let spec = LaunchSpec {
        binary: config.game.binary.clone(),
        args: config.game.args.clone(),
        dmb: provider,
        port: settings.validation_port,
        security: settings.validation_security,
        topic_timeout: config.topic_timeout(),
    };

    let controller = SessionController::launch(spec).await?;

    let outcome = validation_handshake(config, &controller, ctx).await;
    controller.terminate(config.shutdown_grace()).await;
    outcome
}

async fn validation_handshake(
    config: &GlobalConfig,
    controller: &SessionController,
    ctx: &JobContext,
) -> Result<()> {
    let launch = tokio::select! {
        result = async {
            tokio::time::timeout(config.startup_timeout(), controller.launch_result())
                .await
                .map_err(|_| AppError::Compile("validation session never became ready".into()))
                .and_then(|inner| inner)
        } => result?,
        () = ctx.cancel.cancelled() => {
            return Err(AppError::Cancelled("deployment cancelled mid-validation".into()));
        }
    };

    if !launch.succeeded() {
        return Err(AppError::Compile(format!(
            "validation session crashed with exit code {:?}",
            launch.exit_code
        )));
    }

    if launch.validation != ApiValidationStatus::Validated {
        return Err(AppError::Compile(format!(
            "build failed api validation: {:?}",
            launch.validation
        )));
    }

    let response = controller.send_command("ping", &ctx.cancel).await?;
    info!(response, "validation session answered the handshake");
    Ok(())
}

/// Snapshot the repository revision via git, degrading to `untracked`
/// for a plain directory.
async fn snapshot_revision(repository_dir: &Path) -> RevisionInformation {
    let commit_sha = match git_rev_parse(repository_dir, "HEAD").await {
        Some(sha) => sha,
        None => {
            warn!(
                repo = %repository_dir.display(),
                "repository has no readable git HEAD; recording revision as untracked"
            );
            return RevisionInformation {
                commit_sha: "untracked".into(),
                origin_commit_sha: None,
            };
        }
    };

    let origin_commit_sha = git_rev_parse(repository_dir, "@{upstream}").await;

    RevisionInformation {
        commit_sha,
        origin_commit_sha,
    }
}

async fn git_rev_parse(repository_dir: &Path, rev: &str) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(repository_dir)
        .arg("rev-parse")
        .arg(rev)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if sha.is_empty() {
        None
    } else {
        Some(sha)
    }
}
