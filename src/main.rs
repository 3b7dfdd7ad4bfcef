#![forbid(unsafe_code)]

//! `world-warden` — game-server watchdog and deployment host binary.
//!
//! Bootstraps configuration, the database, the job manager, and the
//! watchdog; reattaches to a surviving game process when possible; and
//! releases the session for reattach on graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use world_warden::config::GlobalConfig;
use world_warden::deploy::DeploymentPipeline;
use world_warden::jobs::JobManager;
use world_warden::models::settings::DeploySettings;
use world_warden::persistence::job_repo::JobRepo;
use world_warden::persistence::settings_repo::SettingsRepo;
use world_warden::persistence::db;
use world_warden::rights::Rights;
use world_warden::watchdog::Watchdog;
use world_warden::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "world-warden", about = "Game-server watchdog and deployment host", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run one deployment at startup before supervising.
    #[arg(long)]
    deploy: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("world-warden host bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let database = Arc::new(db::connect(&config.db_path()).await?);
    info!("database connected");

    // ── Startup recovery ────────────────────────────────
    let job_repo = JobRepo::new(Arc::clone(&database));
    let orphaned = job_repo.fail_orphaned().await?;
    if orphaned > 0 {
        warn!(orphaned, "failed jobs left in flight by a previous host instance");
    }

    let settings_repo = SettingsRepo::new(Arc::clone(&database));
    settings_repo
        .seed_if_missing(&DeploySettings::seed(config.deploy.default_validation_port))
        .await?;

    // ── Build subsystems ────────────────────────────────
    let jobs = Arc::new(JobManager::new(job_repo, config.jobs.max_concurrent));
    let watchdog = Arc::new(Watchdog::new(Arc::clone(&config), Arc::clone(&database)));
    let pipeline = DeploymentPipeline::new(
        Arc::clone(&config),
        Arc::clone(&database),
        Arc::clone(&jobs),
        Arc::clone(&watchdog),
    );

    // ── Bring the watchdog online ───────────────────────
    if let Err(err) = watchdog.startup().await {
        error!(%err, "watchdog startup failed");
    }

    let ct = CancellationToken::new();
    let loop_watchdog = Arc::clone(&watchdog);
    let loop_ct = ct.clone();
    let watchdog_handle = tokio::spawn(async move {
        if let Err(err) = loop_watchdog.run(loop_ct).await {
            error!(%err, "watchdog loop failed");
        }
    });

    // ── Optional bootstrap deployment ───────────────────
    if args.deploy {
        // The host identity holds every right; transport callers do not.
        let job = pipeline
            .create("host-bootstrap", Rights(u64::MAX), &ct)
            .await?;
        info!(job_id = %job.id, "bootstrap deployment admitted");
    }

    info!("world-warden ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Graceful shutdown ───────────────────────────────
    jobs.cancel_all().await;

    match watchdog.release_for_restart().await {
        Ok(Some(info)) => info!(pid = info.pid, "game session left running for reattach"),
        Ok(None) => info!("no live session to release"),
        Err(err) => {
            error!(%err, "failed to release session; terminating it instead");
            watchdog.shutdown().await;
        }
    }

    let _ = watchdog_handle.await;
    info!("world-warden shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
