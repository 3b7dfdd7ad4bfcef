//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Settings for the supervised game-server process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GameConfig {
    /// Game-server binary launched for each session.
    pub binary: String,
    /// Extra arguments passed to the binary before the injected environment.
    #[serde(default)]
    pub args: Vec<String>,
    /// Port the active session's control endpoint listens on.
    pub port: u16,
    /// Port used by the staging session during a zero-downtime swap.
    pub staging_port: u16,
}

/// Deployment pipeline settings that are fixed per host.
///
/// Mutable deployment settings (project name, validation port, security
/// level) live in the database and are changed through
/// [`crate::deploy::DeploymentPipeline::update_settings`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeployConfig {
    /// Source repository compiled by each deployment.
    pub repository_dir: PathBuf,
    /// Compiler binary invoked as a black box.
    pub compiler_program: String,
    /// Compiler arguments; `{source}` and `{output}` are substituted.
    #[serde(default)]
    pub compiler_args: Vec<String>,
    /// Seed value for the validation port when no settings row exists yet.
    #[serde(default = "default_validation_port")]
    pub default_validation_port: u16,
}

/// Watchdog restart policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Consecutive launch failures tolerated before the watchdog degrades.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Base delay between restart attempts; doubles per consecutive failure.
    #[serde(default = "default_restart_backoff_seconds")]
    pub restart_backoff_seconds: u64,
}

/// Job scheduler limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobsConfig {
    /// Maximum operations executing concurrently on the worker pool.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent: u32,
}

/// Configurable timeout values (seconds) for process interactions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for a single control-protocol round trip.
    #[serde(default = "default_topic_seconds")]
    pub topic_seconds: u64,
    /// Deadline for a freshly launched process to announce readiness.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Grace period before a terminating process is force-killed.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_validation_port() -> u16 {
    4779
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_restart_backoff_seconds() -> u64 {
    5
}

fn default_max_concurrent_jobs() -> u32 {
    4
}

fn default_topic_seconds() -> u64 {
    10
}

fn default_startup_seconds() -> u64 {
    60
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        max_consecutive_failures: default_max_consecutive_failures(),
        restart_backoff_seconds: default_restart_backoff_seconds(),
    }
}

fn default_jobs() -> JobsConfig {
    JobsConfig {
        max_concurrent: default_max_concurrent_jobs(),
    }
}

fn default_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        topic_seconds: default_topic_seconds(),
        startup_seconds: default_startup_seconds(),
        shutdown_grace_seconds: default_shutdown_grace_seconds(),
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory for the database, deployments, and reattach state.
    pub data_dir: PathBuf,
    /// Game process settings.
    pub game: GameConfig,
    /// Deployment pipeline settings.
    pub deploy: DeployConfig,
    /// Watchdog restart policy.
    #[serde(default = "default_watchdog")]
    pub watchdog: WatchdogConfig,
    /// Job scheduler limits.
    #[serde(default = "default_jobs")]
    pub jobs: JobsConfig,
    /// Timeout configuration for process interactions.
    #[serde(default = "default_timeouts")]
    pub timeouts: TimeoutConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("warden.db")
    }

    /// Directory receiving one output subdirectory per deployment job.
    #[must_use]
    pub fn deployments_dir(&self) -> PathBuf {
        self.data_dir.join("deployments")
    }

    /// Deadline for a single control-protocol round trip.
    #[must_use]
    pub fn topic_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.topic_seconds)
    }

    /// Deadline for a freshly launched process to announce readiness.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.startup_seconds)
    }

    /// Grace period before a terminating process is force-killed.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_grace_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.game.binary.is_empty() {
            return Err(AppError::Config("game.binary must not be empty".into()));
        }

        if self.game.port == 0 || self.game.staging_port == 0 {
            return Err(AppError::Config(
                "game.port and game.staging_port must be non-zero".into(),
            ));
        }

        if self.game.port == self.game.staging_port {
            return Err(AppError::Config(
                "game.port and game.staging_port must differ".into(),
            ));
        }

        if self.deploy.compiler_program.is_empty() {
            return Err(AppError::Config(
                "deploy.compiler_program must not be empty".into(),
            ));
        }

        if self.jobs.max_concurrent == 0 {
            return Err(AppError::Config(
                "jobs.max_concurrent must be greater than zero".into(),
            ));
        }

        fs::create_dir_all(&self.data_dir)
            .map_err(|err| AppError::Config(format!("cannot create data_dir: {err}")))?;
        self.data_dir = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;

        self.deploy.repository_dir = self
            .deploy
            .repository_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("deploy.repository_dir invalid: {err}")))?;

        Ok(())
    }
}
