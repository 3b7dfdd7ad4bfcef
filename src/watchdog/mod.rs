//! Watchdog: supervises the active game session, recovers crashes,
//! performs zero-downtime deployment swaps, and reattaches across host
//! restarts.
//!
//! The watchdog owns up to two session controllers: the active primary
//! and, mid-deploy, a staging session validating the new build. A staged
//! session is promoted when the primary announces the reboot that
//! releases the active port.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GlobalConfig;
use crate::models::reattach::ReattachInformation;
use crate::models::settings::SecurityLevel;
use crate::persistence::compile_job_repo::CompileJobRepo;
use crate::persistence::db::Database;
use crate::persistence::reattach_repo::ReattachRepo;
use crate::session::process::ProcessExit;
use crate::session::{DmbProvider, LaunchSpec, SessionController};
use crate::{AppError, Result};

/// Capacity of the pending-deployment queue.
const SWAP_QUEUE_CAPACITY: usize = 4;

/// Ceiling for the exponential restart backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Lifecycle status of the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// No session is running.
    Offline,
    /// The primary session is live.
    Running,
    /// A crashed session is being relaunched.
    Restoring,
    /// Too many consecutive failures; external intervention required.
    Degraded,
}

/// Mutable watchdog state behind one lock.
struct State {
    primary: Option<SessionController>,
    staging: Option<(SessionController, Arc<DmbProvider>)>,
    last_good: Option<Arc<DmbProvider>>,
    consecutive_failures: u32,
}

/// Supervises one-or-two session controllers.
pub struct Watchdog {
    config: Arc<GlobalConfig>,
    reattach_repo: ReattachRepo,
    compile_job_repo: CompileJobRepo,
    state: Mutex<State>,
    swap_tx: mpsc::Sender<Arc<DmbProvider>>,
    swap_rx: Mutex<Option<mpsc::Receiver<Arc<DmbProvider>>>>,
    status_tx: watch::Sender<WatchdogStatus>,
    status_rx: watch::Receiver<WatchdogStatus>,
}

impl Watchdog {
    /// Create an offline watchdog.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, db: Arc<Database>) -> Self {
        let (swap_tx, swap_rx) = mpsc::channel(SWAP_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(WatchdogStatus::Offline);

        Self {
            config,
            reattach_repo: ReattachRepo::new(Arc::clone(&db)),
            compile_job_repo: CompileJobRepo::new(db),
            state: Mutex::new(State {
                primary: None,
                staging: None,
                last_good: None,
                consecutive_failures: 0,
            }),
            swap_tx,
            swap_rx: Mutex::new(Some(swap_rx)),
            status_tx,
            status_rx,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status transitions.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<WatchdogStatus> {
        self.status_rx.clone()
    }

    /// Pid of the current primary session, if one is live.
    pub async fn primary_pid(&self) -> Option<u32> {
        self.state
            .lock()
            .await
            .primary
            .as_ref()
            .map(|p| p.process().pid())
    }

    /// Port of the current primary session, if one is live.
    pub async fn primary_port(&self) -> Option<u16> {
        self.state.lock().await.primary.as_ref().map(SessionController::port)
    }

    /// Hand a validated build to the watchdog for eventual promotion.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the watchdog is shutting down.
    pub async fn queue_deployment(&self, provider: Arc<DmbProvider>) -> Result<()> {
        self.swap_tx
            .send(provider)
            .await
            .map_err(|_| AppError::Conflict("watchdog is no longer accepting deployments".into()))
    }

    /// Bring the watchdog online at host startup.
    ///
    /// Attempts to reattach to a process left running by a previous host
    /// instance; falls back to a cold launch of the most recent
    /// successful deployment; stays offline when neither exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failures. Reattach and
    /// launch failures are logged and degrade to the next option.
    pub async fn startup(&self) -> Result<()> {
        if let Some(info) = self.reattach_repo.load().await? {
            match self.try_reattach(&info).await {
                Ok(()) => {
                    self.reattach_repo.clear().await?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(%err, pid = info.pid, "reattach failed, falling back to cold launch");
                    self.reattach_repo.clear().await?;
                }
            }
        }

        let Some(compile_job) = self.compile_job_repo.latest().await? else {
            info!("no deployment available yet; watchdog staying offline");
            return Ok(());
        };

        match DmbProvider::from_directory(&compile_job.output_dir) {
            Ok(provider) => {
                let provider = Arc::new(provider);
                if let Err(err) = self.launch_primary(Arc::clone(&provider)).await {
                    error!(%err, "cold launch failed at startup");
                }
            }
            Err(err) => {
                warn!(%err, "latest deployment directory is gone; staying offline");
            }
        }

        Ok(())
    }

    /// Reconstruct the primary from a reattach snapshot and confirm the
    /// process answers an authenticated ping.
    async fn try_reattach(&self, info: &ReattachInformation) -> Result<()> {
        let provider = Arc::new(DmbProvider::from_directory(&info.dmb_dir)?);
        let controller =
            SessionController::reattach(info, Arc::clone(&provider), self.config.topic_timeout())
                .await?;

        let ping_cancel = CancellationToken::new();
        let response = controller.send_command("ping", &ping_cancel).await?;
        debug!(response, "reattached session answered ping");

        let mut state = self.state.lock().await;
        state.primary = Some(controller);
        state.last_good = Some(provider);
        state.consecutive_failures = 0;
        drop(state);

        self.set_status(WatchdogStatus::Running);
        info!(pid = info.pid, port = info.port, "watchdog reattached to live session");
        Ok(())
    }

    /// Launch a fresh primary session from `provider`.
    async fn launch_primary(&self, provider: Arc<DmbProvider>) -> Result<()> {
        let controller = self.launch_session(Arc::clone(&provider), self.config.game.port).await?;

        let mut state = self.state.lock().await;
        state.primary = Some(controller);
        state.last_good = Some(provider);
        state.consecutive_failures = 0;
        drop(state);

        self.set_status(WatchdogStatus::Running);
        Ok(())
    }

    /// Launch one session on `port` and await a successful load.
    async fn launch_session(
        &self,
        provider: Arc<DmbProvider>,
        port: u16,
    ) -> Result<SessionController> {
        let spec = LaunchSpec {
            binary: self.config.game.binary.clone(),
            args: self.config.game.args.clone(),
            dmb: provider,
            port,
            security: SecurityLevel::Trusted,
            topic_timeout: self.config.topic_timeout(),
        };

        let controller = SessionController::launch(spec).await?;

        let result = tokio::time::timeout(
            self.config.startup_timeout(),
            controller.launch_result(),
        )
        .await
        .map_err(|_| {
            AppError::Timeout("process never announced readiness".into())
        })
        .and_then(|inner| inner);

        match result {
            Ok(launch) if launch.succeeded() => Ok(controller),
            Ok(launch) => {
                Err(AppError::ProcessCrashed(format!(
                    "process died during load with exit code {:?}",
                    launch.exit_code
                )))
            }
            Err(err) => {
                controller.terminate(self.config.shutdown_grace()).await;
                Err(err)
            }
        }
    }

    /// Run the supervision loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the loop is already running.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut swap_rx = self
            .swap_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Conflict("watchdog loop already running".into()))?;

        info!("watchdog supervision loop started");

        'outer: loop {
            if cancel.is_cancelled() {
                break;
            }

            let session = {
                let state = self.state.lock().await;
                state
                    .primary
                    .as_ref()
                    .map(|p| (p.process(), p.subscribe_reboot()))
            };

            let Some((process, mut reboot_rx)) = session else {
                tokio::select! {
                    () = cancel.cancelled() => break 'outer,
                    provider = swap_rx.recv() => {
                        let Some(provider) = provider else { break 'outer };
                        self.deploy(provider, &cancel).await;
                    }
                }
                continue;
            };

            // Inner loop for this session generation; re-snapshot after
            // any event that may have replaced the primary.
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break 'outer,

                    exit = process.wait() => {
                        self.handle_exit(process.pid(), exit, &cancel).await;
                        break;
                    }

                    reboot = reboot_rx.recv() => {
                        if reboot.is_ok() {
                            if self.handle_reboot(&cancel).await {
                                break;
                            }
                        } else {
                            // Pump gone; the exit arm resolves momentarily.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }

                    provider = swap_rx.recv() => {
                        let Some(provider) = provider else { break 'outer };
                        self.deploy(provider, &cancel).await;
                    }
                }
            }
        }

        info!("watchdog supervision loop stopped");
        Ok(())
    }

    /// React to the primary's process exiting.
    ///
    /// `pid` identifies the process the loop was waiting on; an exit
    /// reported for a session that was already released or promoted is
    /// ignored.
    async fn handle_exit(&self, pid: u32, exit: ProcessExit, cancel: &CancellationToken) {
        let (was_requested, last_good) = {
            let mut state = self.state.lock().await;
            let current_pid = state.primary.as_ref().map(|p| p.process().pid());
            if current_pid != Some(pid) {
                debug!(pid, "ignoring exit of a session no longer owned");
                return;
            }

            let requested = state
                .primary
                .take()
                .is_some_and(|p| p.termination_was_requested());
            (requested, state.last_good.clone())
        };

        if was_requested {
            info!("session ended as requested");
            self.set_status(WatchdogStatus::Offline);
            return;
        }

        warn!(exit_code = ?exit.code, "session crashed unexpectedly");

        let Some(provider) = last_good else {
            error!("no known-good build to restore; watchdog going offline");
            self.set_status(WatchdogStatus::Offline);
            return;
        };

        self.set_status(WatchdogStatus::Restoring);
        self.restore(provider, cancel).await;
    }

    /// Relaunch the last known-good build with exponential backoff until
    /// a launch succeeds or the failure cap degrades the watchdog.
    async fn restore(&self, provider: Arc<DmbProvider>, cancel: &CancellationToken) {
        loop {
            let failures = {
                let mut state = self.state.lock().await;
                state.consecutive_failures += 1;
                state.consecutive_failures
            };

            if failures > self.config.watchdog.max_consecutive_failures {
                error!(
                    failures,
                    "restart cap exceeded; watchdog degraded, manual intervention required"
                );
                self.set_status(WatchdogStatus::Degraded);
                return;
            }

            let backoff = restart_backoff(
                self.config.watchdog.restart_backoff_seconds,
                failures,
            );
            info!(attempt = failures, ?backoff, "restarting crashed session");

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }

            match self.launch_primary(Arc::clone(&provider)).await {
                Ok(()) => {
                    info!("session restored");
                    return;
                }
                Err(err) => {
                    warn!(%err, "restart attempt failed");
                }
            }
        }
    }

    /// React to a reboot announcement from the primary.
    ///
    /// Resets the cached reboot state (the process consumed any pending
    /// request) and completes a pending promotion when the primary was
    /// told to release its port. Returns whether the primary changed.
    async fn handle_reboot(&self, cancel: &CancellationToken) -> bool {
        let promotion = {
            let mut state = self.state.lock().await;
            let Some(primary) = state.primary.as_ref() else {
                return false;
            };

            primary.reset_reboot_state();

            if state.staging.is_some() && primary.close_port_on_reboot() {
                let staged = state.staging.take();
                let old = state.primary.take();
                old.zip(staged)
            } else {
                None
            }
        };

        let Some((old, (staged, provider))) = promotion else {
            debug!("world rebooted");
            return false;
        };

        info!("primary released its port; promoting staged session");

        // The old session was told to shut down at this reboot; make sure
        // it is gone before the staged session takes the port.
        old.terminate(self.config.shutdown_grace()).await;

        match staged.set_port(self.config.game.port, cancel).await {
            Ok(true) => {
                info!(port = self.config.game.port, "staged session took the active port");
            }
            Ok(false) | Err(_) => {
                warn!(
                    port = staged.port(),
                    "staged session kept its staging port; promotion continues"
                );
            }
        }

        let mut state = self.state.lock().await;
        state.primary = Some(staged);
        state.last_good = Some(provider);
        state.consecutive_failures = 0;
        drop(state);

        self.set_status(WatchdogStatus::Running);
        true
    }

    /// Stage a new build, or launch it directly when nothing is running.
    async fn deploy(&self, provider: Arc<DmbProvider>, cancel: &CancellationToken) {
        let has_primary = self.state.lock().await.primary.is_some();

        if !has_primary {
            info!("no live session; launching new deployment directly");
            if let Err(err) = self.launch_primary(provider).await {
                error!(%err, "failed to launch new deployment");
            }
            return;
        }

        info!("staging new deployment for zero-downtime swap");
        let staged = match self
            .launch_session(Arc::clone(&provider), self.config.game.staging_port)
            .await
        {
            Ok(controller) => controller,
            Err(err) => {
                warn!(%err, "staged session failed to load; keeping current build");
                return;
            }
        };

        let swap_armed = {
            let state = self.state.lock().await;
            if let Some(primary) = state.primary.as_ref() {
                primary.set_close_port_on_reboot(true);
                true
            } else {
                false
            }
        };

        if swap_armed {
            let reboot_requested = {
                let state = self.state.lock().await;
                match state.primary.as_ref() {
                    Some(primary) => {
                        primary
                            .set_reboot_state(crate::session::RebootState::Shutdown, cancel)
                            .await
                    }
                    None => Ok(false),
                }
            };

            match reboot_requested {
                Ok(true) => {
                    let mut state = self.state.lock().await;
                    state.staging = Some((staged, provider));
                    info!("swap armed; waiting for the primary's next reboot");
                    return;
                }
                Ok(false) => warn!("primary rejected the shutdown request; swap abandoned"),
                Err(err) => warn!(%err, "could not arm the swap; swap abandoned"),
            }
        }

        staged.terminate(self.config.shutdown_grace()).await;
    }

    /// Release the primary without terminating it and persist the
    /// snapshot for the next host instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the snapshot cannot be persisted.
    pub async fn release_for_restart(&self) -> Result<Option<ReattachInformation>> {
        let primary = {
            let mut state = self.state.lock().await;
            if let Some((staged, _)) = state.staging.take() {
                // A half-finished swap cannot survive a host restart.
                staged.terminate(self.config.shutdown_grace()).await;
            }
            state.primary.take()
        };

        let Some(primary) = primary else {
            return Ok(None);
        };

        let info = primary.release().await?;
        self.reattach_repo.save(&info).await?;
        self.set_status(WatchdogStatus::Offline);
        info!(pid = info.pid, "session released and reattach snapshot persisted");
        Ok(Some(info))
    }

    /// Terminate everything the watchdog owns. Used when the host goes
    /// down without the intent to reattach.
    pub async fn shutdown(&self) {
        let (primary, staging) = {
            let mut state = self.state.lock().await;
            (state.primary.take(), state.staging.take())
        };

        if let Some((staged, _)) = staging {
            staged.terminate(self.config.shutdown_grace()).await;
        }
        if let Some(primary) = primary {
            primary.terminate(self.config.shutdown_grace()).await;
        }

        self.set_status(WatchdogStatus::Offline);
    }

    fn set_status(&self, status: WatchdogStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Exponential backoff for restart attempt `attempt` (1-based).
fn restart_backoff(base_seconds: u64, attempt: u32) -> Duration {
    let factor = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_secs(base_seconds.saturating_mul(factor)).min(MAX_BACKOFF)
}
