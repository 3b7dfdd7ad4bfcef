//! Session controller: owns one game process and speaks its control
//! protocol.
//!
//! Exactly one protocol request is in flight per controller; concurrent
//! callers queue on a FIFO-fair async mutex. The reboot-state machine is
//! mutated only through [`SessionController::set_reboot_state`] (protocol
//! round trip) and [`SessionController::reset_reboot_state`] (local only,
//! acknowledging a state the process already consumed on its own).

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::reattach::ReattachInformation;
use crate::models::settings::SecurityLevel;
use crate::session::dmb::DmbProvider;
use crate::session::events::{EventListener, SessionEvent};
use crate::session::process::{self, ProcessExit, ProcessHandle};
use crate::session::topic::TopicClient;
use crate::{AppError, Result};

/// Interop major version this host understands.
pub const SUPPORTED_API_MAJOR: u32 = 1;

/// Capacity of the event channel between listener and pump.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the reboot / custom-command broadcast channels.
const BROADCAST_CAPACITY: usize = 16;

/// Behavior the process adopts at its next internal reboot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RebootState {
    /// Reboot in place.
    Normal,
    /// Exit instead of rebooting.
    Shutdown,
    /// Exit and let the watchdog relaunch.
    Restart,
}

impl RebootState {
    /// Wire spelling used by the control protocol.
    #[must_use]
    pub fn as_command(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Shutdown,
            2 => Self::Restart,
            _ => Self::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Shutdown => 1,
            Self::Restart => 2,
        }
    }
}

/// Outcome of the interop handshake for one launch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiValidationStatus {
    /// The build never announced an interop version.
    NeverValidated,
    /// The build announced an unsupported interop version.
    Incompatible,
    /// The build announced a supported interop version.
    Validated,
}

impl ApiValidationStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Incompatible,
            2 => Self::Validated,
            _ => Self::NeverValidated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::NeverValidated => 0,
            Self::Incompatible => 1,
            Self::Validated => 2,
        }
    }
}

/// One-shot outcome of a session launch, resolved exactly once when the
/// process finishes its initial load or dies first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchResult {
    /// Time from spawn to readiness (or to death when `crashed`).
    pub startup: Duration,
    /// Whether the process died before completing its first load.
    pub crashed: bool,
    /// Exit code observed when `crashed`.
    pub exit_code: Option<i32>,
    /// Interop handshake outcome.
    pub validation: ApiValidationStatus,
}

impl LaunchResult {
    /// Whether the process completed its initial load.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.crashed
    }
}

/// Everything needed to launch a fresh session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Game-server binary.
    pub binary: String,
    /// Extra arguments for the binary.
    pub args: Vec<String>,
    /// Build the session runs.
    pub dmb: Arc<DmbProvider>,
    /// Port the process's control endpoint will listen on.
    pub port: u16,
    /// Engine sandbox level for this session.
    pub security: SecurityLevel,
    /// Deadline for each control-protocol round trip.
    pub topic_timeout: Duration,
}

/// State shared between the controller and its event pump.
#[derive(Debug)]
struct Shared {
    validation: AtomicU8,
    reboot_state: AtomicU8,
    custom_enabled: AtomicBool,
    close_port_on_reboot: AtomicBool,
}

/// Handles communication with one game-server process.
#[derive(Debug)]
pub struct SessionController {
    process: Arc<ProcessHandle>,
    shared: Arc<Shared>,
    dmb: std::sync::Mutex<Arc<DmbProvider>>,
    access_token: String,
    port: AtomicU16,
    event_port: u16,
    topic: TopicClient,
    topic_gate: Mutex<()>,
    reboot_request_seq: AtomicU64,
    launch_rx: watch::Receiver<Option<LaunchResult>>,
    reboot_tx: broadcast::Sender<()>,
    custom_tx: broadcast::Sender<String>,
    pump_cancel: CancellationToken,
}

impl SessionController {
    /// Launch a fresh game process and begin supervising it.
    ///
    /// The session's port, event port, access token, build directory, and
    /// security level are injected through the environment after the
    /// allowlist strip.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Communication` if the event port cannot be
    /// bound, or `AppError::Io` if the spawn fails.
    pub async fn launch(spec: LaunchSpec) -> Result<Self> {
        let access_token = Uuid::new_v4().to_string();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pump_cancel = CancellationToken::new();

        let listener = EventListener::bind(
            0,
            access_token.clone(),
            event_tx,
            pump_cancel.child_token(),
        )
        .await?;

        let mut command = process::build_command(&spec.binary, &spec.args);
        command
            .env("WARDEN_PORT", spec.port.to_string())
            .env("WARDEN_EVENT_PORT", listener.port().to_string())
            .env("WARDEN_ACCESS_TOKEN", &access_token)
            .env("WARDEN_DMB", spec.dmb.primary_dir())
            .env("WARDEN_SECURITY", spec.security.as_str())
            .current_dir(spec.dmb.primary_dir());

        let process = Arc::new(ProcessHandle::spawn(command)?);
        info!(
            pid = process.pid(),
            port = spec.port,
            event_port = listener.port(),
            "game session launched"
        );

        Ok(Self::assemble(
            process,
            spec.dmb,
            spec.port,
            listener.port(),
            access_token,
            spec.topic_timeout,
            event_rx,
            pump_cancel,
            None,
        ))
    }

    /// Reconstruct a controller around an already-running process.
    ///
    /// Re-binds the persisted event port so the process's next event
    /// connection lands here. The caller should follow up with an
    /// authenticated `ping` round trip to confirm identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessCrashed` if the process is gone,
    /// `AppError::Conflict` if the pid was recycled, or
    /// `AppError::Communication` if the event port cannot be re-bound.
    pub async fn reattach(
        info: &ReattachInformation,
        dmb: Arc<DmbProvider>,
        topic_timeout: Duration,
    ) -> Result<Self> {
        let process = Arc::new(ProcessHandle::reattach(info.pid, info.launched_at)?);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pump_cancel = CancellationToken::new();
        let listener = EventListener::bind(
            info.event_port,
            info.access_token.clone(),
            event_tx,
            pump_cancel.child_token(),
        )
        .await?;

        info!(pid = info.pid, port = info.port, "session reattached");

        // The process loaded long ago; the launch result is already known.
        let initial = LaunchResult {
            startup: Duration::ZERO,
            crashed: false,
            exit_code: None,
            validation: ApiValidationStatus::NeverValidated,
        };

        Ok(Self::assemble(
            process,
            dmb,
            info.port,
            listener.port(),
            info.access_token.clone(),
            topic_timeout,
            event_rx,
            pump_cancel,
            Some(initial),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        process: Arc<ProcessHandle>,
        dmb: Arc<DmbProvider>,
        port: u16,
        event_port: u16,
        access_token: String,
        topic_timeout: Duration,
        event_rx: mpsc::Receiver<SessionEvent>,
        pump_cancel: CancellationToken,
        initial: Option<LaunchResult>,
    ) -> Self {
        let shared = Arc::new(Shared {
            validation: AtomicU8::new(
                initial.map_or(ApiValidationStatus::NeverValidated, |r| r.validation).as_u8(),
            ),
            reboot_state: AtomicU8::new(RebootState::Normal.as_u8()),
            custom_enabled: AtomicBool::new(false),
            close_port_on_reboot: AtomicBool::new(false),
        });

        let (launch_tx, launch_rx) = watch::channel(initial);
        let (reboot_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (custom_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        tokio::spawn(event_pump(
            Arc::clone(&process),
            Arc::clone(&shared),
            event_rx,
            launch_tx,
            reboot_tx.clone(),
            custom_tx.clone(),
            pump_cancel.clone(),
        ));

        Self {
            process,
            shared,
            dmb: std::sync::Mutex::new(dmb),
            access_token: access_token.clone(),
            port: AtomicU16::new(port),
            event_port,
            topic: TopicClient::new(access_token, topic_timeout),
            topic_gate: Mutex::new(()),
            reboot_request_seq: AtomicU64::new(0),
            launch_rx,
            reboot_tx,
            custom_tx,
            pump_cancel,
        }
    }

    /// Await the one-shot launch outcome.
    ///
    /// Safe to call from any number of tasks; every caller observes the
    /// same resolved value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessCrashed` if the session was torn down
    /// before the launch could resolve.
    pub async fn launch_result(&self) -> Result<LaunchResult> {
        let mut rx = self.launch_rx.clone();
        loop {
            if let Some(result) = *rx.borrow() {
                return Ok(result);
            }
            rx.changed().await.map_err(|_| {
                AppError::ProcessCrashed("session ended before launch completed".into())
            })?;
        }
    }

    /// Send a sanitized command and return the process's response.
    ///
    /// Concurrent callers are serialized in arrival order; exactly one
    /// request is in flight at a time. On any failure the in-flight slot
    /// is released before the error is returned.
    ///
    /// # Errors
    ///
    /// `AppError::Invalid` for a command containing the protocol
    /// delimiter, `AppError::Cancelled`, `AppError::Timeout`, or
    /// `AppError::Communication` per the failure mode.
    pub async fn send_command(&self, command: &str, cancel: &CancellationToken) -> Result<String> {
        let _gate = self.topic_gate.lock().await;
        self.topic
            .send(self.port.load(Ordering::SeqCst), command, cancel)
            .await
    }

    /// Ask the process to rebind its control endpoint to `new_port`.
    ///
    /// Returns `Ok(true)` and updates the recorded port on success;
    /// `Ok(false)` leaves the recorded port unchanged.
    ///
    /// # Errors
    ///
    /// Propagates protocol failures; the recorded port is unchanged on
    /// every error path.
    pub async fn set_port(&self, new_port: u16, cancel: &CancellationToken) -> Result<bool> {
        if new_port == 0 {
            return Err(AppError::Invalid("port cannot be 0".into()));
        }

        let _gate = self.topic_gate.lock().await;
        let response = self
            .topic
            .send(
                self.port.load(Ordering::SeqCst),
                &format!("set-port {new_port}"),
                cancel,
            )
            .await?;

        if response == "ok" {
            self.port.store(new_port, Ordering::SeqCst);
            info!(port = new_port, "session moved to new port");
            Ok(true)
        } else {
            warn!(port = new_port, response, "process rejected port change");
            Ok(false)
        }
    }

    /// Request the process adopt `new_state` at its next reboot.
    ///
    /// A newer request supersedes an older one that has not reached the
    /// wire yet: the superseded call reports success without a round
    /// trip and the newest request performs the only exchange.
    ///
    /// # Errors
    ///
    /// Propagates protocol failures; the cached state is unchanged on
    /// every error path.
    pub async fn set_reboot_state(
        &self,
        new_state: RebootState,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let seq = self.reboot_request_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let _gate = self.topic_gate.lock().await;
        if self.reboot_request_seq.load(Ordering::SeqCst) != seq {
            debug!(state = new_state.as_command(), "reboot-state request superseded");
            return Ok(true);
        }

        let response = self
            .topic
            .send(
                self.port.load(Ordering::SeqCst),
                &format!("set-reboot-state {}", new_state.as_command()),
                cancel,
            )
            .await?;

        if response == "ok" {
            self.shared
                .reboot_state
                .store(new_state.as_u8(), Ordering::SeqCst);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reset the cached reboot state to `Normal` without contacting the
    /// process.
    ///
    /// Used after a reboot event shows the process consumed and
    /// auto-reset a prior request on its own.
    pub fn reset_reboot_state(&self) {
        self.shared
            .reboot_state
            .store(RebootState::Normal.as_u8(), Ordering::SeqCst);
    }

    /// Current cached reboot state.
    #[must_use]
    pub fn reboot_state(&self) -> RebootState {
        RebootState::from_u8(self.shared.reboot_state.load(Ordering::SeqCst))
    }

    /// Subscribe to the recurring reboot signal.
    ///
    /// Each reboot announcement reaches every live subscriber; the
    /// subscription survives any number of reboots.
    #[must_use]
    pub fn subscribe_reboot(&self) -> broadcast::Receiver<()> {
        self.reboot_tx.subscribe()
    }

    /// Subscribe to custom chat commands extracted from protocol traffic.
    #[must_use]
    pub fn subscribe_custom_commands(&self) -> broadcast::Receiver<String> {
        self.custom_tx.subscribe()
    }

    /// Idempotently enable extraction of custom chat commands.
    pub fn enable_custom_chat_commands(&self) {
        self.shared.custom_enabled.store(true, Ordering::SeqCst);
    }

    /// Atomically swap the active build, disposing the prior one.
    ///
    /// Does not disturb an in-flight protocol request or the launch
    /// result; no reader observes the stale provider after this returns.
    pub fn replace_dmb_provider(&self, new_provider: Arc<DmbProvider>) {
        let mut guard = self
            .dmb
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let old = std::mem::replace(&mut *guard, new_provider);
        drop(guard);
        debug!(dir = %old.primary_dir().display(), "superseded build provider released");
        drop(old);
    }

    /// The active build.
    #[must_use]
    pub fn dmb(&self) -> Arc<DmbProvider> {
        Arc::clone(
            &self
                .dmb
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Detach from the process without terminating it.
    ///
    /// Waits for any in-flight protocol request to drain, stops the
    /// event listener and pump, and returns the snapshot a future
    /// controller needs to adopt the still-running process.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the other lifecycle
    /// operations.
    pub async fn release(self) -> Result<ReattachInformation> {
        let _gate = self.topic_gate.lock().await;

        self.pump_cancel.cancel();
        self.process.detach();

        let info = ReattachInformation {
            pid: self.process.pid(),
            port: self.port.load(Ordering::SeqCst),
            event_port: self.event_port,
            access_token: self.access_token.clone(),
            dmb_dir: self.dmb().primary_dir().display().to_string(),
            launched_at: self.process.launched_at(),
        };

        info!(pid = info.pid, port = info.port, "session released for reattach");
        Ok(info)
    }

    /// Terminate the process with a grace period, then force-kill.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        let exit = self.process.terminate_with_grace(grace).await;
        self.pump_cancel.cancel();
        exit
    }

    /// Interop handshake outcome so far.
    #[must_use]
    pub fn api_validation_status(&self) -> ApiValidationStatus {
        ApiValidationStatus::from_u8(self.shared.validation.load(Ordering::SeqCst))
    }

    /// Port the control endpoint currently listens on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Access token embedded in every protocol exchange.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Port of the host-side event listener.
    #[must_use]
    pub fn event_port(&self) -> u16 {
        self.event_port
    }

    /// Whether the watchdog should release the port at the next reboot.
    #[must_use]
    pub fn close_port_on_reboot(&self) -> bool {
        self.shared.close_port_on_reboot.load(Ordering::SeqCst)
    }

    /// Govern whether the port is released at the next reboot.
    pub fn set_close_port_on_reboot(&self, close: bool) {
        self.shared
            .close_port_on_reboot
            .store(close, Ordering::SeqCst);
    }

    /// Whether an observed or upcoming exit was asked for.
    #[must_use]
    pub fn termination_was_requested(&self) -> bool {
        self.process.termination_was_requested()
    }

    /// Handle to the underlying process.
    #[must_use]
    pub fn process(&self) -> Arc<ProcessHandle> {
        Arc::clone(&self.process)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.pump_cancel.cancel();
    }
}

/// Classify a reported interop version against the supported major.
fn classify_api_version(api_version: Option<&str>) -> ApiValidationStatus {
    match api_version {
        None => ApiValidationStatus::NeverValidated,
        Some(version) => {
            let major = version
                .split('.')
                .next()
                .and_then(|raw| raw.parse::<u32>().ok());
            if major == Some(SUPPORTED_API_MAJOR) {
                ApiValidationStatus::Validated
            } else {
                ApiValidationStatus::Incompatible
            }
        }
    }
}

/// Event pump: folds listener events and process exit into controller
/// state, resolving the launch result exactly once.
async fn event_pump(
    process: Arc<ProcessHandle>,
    shared: Arc<Shared>,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    launch_tx: watch::Sender<Option<LaunchResult>>,
    reboot_tx: broadcast::Sender<()>,
    custom_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut resolved = launch_tx.borrow().is_some();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            exit = process.wait() => {
                if !resolved {
                    let result = LaunchResult {
                        startup: started.elapsed(),
                        crashed: true,
                        exit_code: exit.code,
                        validation: ApiValidationStatus::from_u8(
                            shared.validation.load(Ordering::SeqCst),
                        ),
                    };
                    warn!(exit_code = ?exit.code, "process died before completing its load");
                    let _ = launch_tx.send(Some(result));
                }
                break;
            }

            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Ready { api_version } => {
                        let status = classify_api_version(api_version.as_deref());
                        shared.validation.store(status.as_u8(), Ordering::SeqCst);

                        if !resolved {
                            resolved = true;
                            let result = LaunchResult {
                                startup: started.elapsed(),
                                crashed: false,
                                exit_code: None,
                                validation: status,
                            };
                            info!(?status, startup = ?result.startup, "session completed its load");
                            let _ = launch_tx.send(Some(result));
                        }
                    }
                    SessionEvent::Reboot => {
                        debug!("world announced a reboot");
                        let _ = reboot_tx.send(());
                    }
                    SessionEvent::TerminationRequested => {
                        info!("process announced an intentional shutdown");
                        process.mark_termination_requested();
                    }
                    SessionEvent::CustomCommand(command) => {
                        if shared.custom_enabled.load(Ordering::SeqCst) {
                            let _ = custom_tx.send(command);
                        } else {
                            debug!("dropping custom command: extraction not enabled");
                        }
                    }
                }
            }
        }
    }
}
