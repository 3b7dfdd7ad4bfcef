//! Thin wrapper over one OS process: spawn or adopt, observe exit,
//! terminate gracefully or by force, detach without killing.
//!
//! Spawned processes are observed by a monitor task awaiting
//! `Child::wait`; adopted (reattached) processes are observed by polling
//! signal 0. Either way the exit lands in a watch channel so any number
//! of callers can await it.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Environment variables inherited by the spawned game process.
///
/// Every other variable is stripped via `env_clear()` before launch so
/// database paths and access tokens from the host environment never leak
/// into the child. Session-specific variables are injected explicitly by
/// the controller.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "RUST_LOG", "TMPDIR", "LANG"];

/// Interval between liveness probes for adopted processes.
const REATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tolerance when matching a persisted launch timestamp against the
/// process table, guarding against pid reuse.
const START_TIME_TOLERANCE_SECS: i64 = 2;

/// Terminal state of a watched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when the process was killed by a signal or its
    /// code could not be observed.
    pub code: Option<i32>,
}

/// Handle to one running OS process, owned exclusively by one session
/// controller.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    launched_at: DateTime<Utc>,
    termination_requested: AtomicBool,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    monitor_cancel: CancellationToken,
}

impl ProcessHandle {
    /// Spawn a new process from a prepared command and start watching it.
    ///
    /// The command's stdio is nulled; all communication happens over the
    /// session's network channels.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the OS spawn fails.
    pub fn spawn(mut command: Command) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|err| AppError::Io(format!("failed to spawn game process: {err}")))?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Io("spawned process has no pid".into()))?;
        let launched_at = Utc::now();

        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor_cancel = CancellationToken::new();

        let monitor_token = monitor_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = child.wait() => {
                    let code = match result {
                        Ok(status) => status.code(),
                        Err(err) => {
                            warn!(pid, %err, "error waiting for game process");
                            None
                        }
                    };
                    debug!(pid, ?code, "game process exited");
                    let _ = exit_tx.send(Some(ProcessExit { code }));
                }
                () = monitor_token.cancelled() => {
                    // Detached — the process keeps running unobserved.
                    info!(pid, "process monitor detached");
                }
            }
        });

        Ok(Self {
            pid,
            launched_at,
            termination_requested: AtomicBool::new(false),
            exit_rx,
            monitor_cancel,
        })
    }

    /// Adopt an already-running process by pid.
    ///
    /// Verifies the process is alive and that its process-table start
    /// time matches `launched_at`, so a recycled pid is rejected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessCrashed` if no live process has this
    /// pid, or `AppError::Conflict` if the pid now names a different
    /// process.
    pub fn reattach(pid: u32, launched_at: DateTime<Utc>) -> Result<Self> {
        if !signal_probe(pid) {
            return Err(AppError::ProcessCrashed(format!(
                "process {pid} is no longer running"
            )));
        }

        verify_start_time(pid, launched_at)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor_cancel = CancellationToken::new();

        let monitor_token = monitor_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = monitor_token.cancelled() => {
                        info!(pid, "process monitor detached");
                        break;
                    }
                    () = tokio::time::sleep(REATTACH_POLL_INTERVAL) => {}
                }

                if !signal_probe(pid) {
                    // Exit codes of non-child processes are not observable.
                    debug!(pid, "adopted process exited");
                    let _ = exit_tx.send(Some(ProcessExit { code: None }));
                    break;
                }
            }
        });

        Ok(Self {
            pid,
            launched_at,
            termination_requested: AtomicBool::new(false),
            exit_rx,
            monitor_cancel,
        })
    }

    /// Process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Timestamp the process was launched.
    #[must_use]
    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    /// Whether the process has not yet been observed to exit.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit state, if the process has exited.
    #[must_use]
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Whether [`Self::request_termination`] was called, or the process
    /// itself announced an intentional shutdown.
    #[must_use]
    pub fn termination_was_requested(&self) -> bool {
        self.termination_requested.load(Ordering::SeqCst)
    }

    /// Record that an upcoming exit is intentional without signalling the
    /// process. Used when the process announces its own shutdown.
    pub fn mark_termination_requested(&self) {
        self.termination_requested.store(true, Ordering::SeqCst);
    }

    /// Await process exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Monitor detached; the exit can no longer be observed.
                return ProcessExit { code: None };
            }
        }
    }

    /// Ask the process to terminate gracefully.
    pub fn request_termination(&self) {
        self.termination_requested.store(true, Ordering::SeqCst);
        send_signal(self.pid, TerminationKind::Graceful);
    }

    /// Kill the process immediately.
    pub fn force_kill(&self) {
        self.termination_requested.store(true, Ordering::SeqCst);
        send_signal(self.pid, TerminationKind::Forced);
    }

    /// Terminate with a grace period, then force-kill.
    ///
    /// Returns the observed exit state.
    pub async fn terminate_with_grace(&self, grace: Duration) -> ProcessExit {
        self.request_termination();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    pid = self.pid,
                    "process did not exit within grace period, forcing kill"
                );
                self.force_kill();
                self.wait().await
            }
        }
    }

    /// Stop watching the process without terminating it.
    ///
    /// After this call the process runs unsupervised; the handle can no
    /// longer observe its exit.
    pub fn detach(&self) {
        self.monitor_cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum TerminationKind {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn send_signal(pid: u32, kind: TerminationKind) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        TerminationKind::Graceful => Signal::SIGTERM,
        TerminationKind::Forced => Signal::SIGKILL,
    };

    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    if let Err(err) = kill(target, signal) {
        warn!(pid, %err, ?signal, "failed to signal process");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, kind: TerminationKind) {
    let _ = (pid, kind);
    warn!(pid, "process signalling is not supported on this platform");
}

/// Probe whether a pid names a live process (signal 0).
#[cfg(unix)]
#[must_use]
pub fn signal_probe(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    kill(target, None).is_ok()
}

/// Probe whether a pid names a live process.
#[cfg(not(unix))]
#[must_use]
pub fn signal_probe(_pid: u32) -> bool {
    false
}

/// Compare the process-table start time for `pid` against a persisted
/// launch timestamp.
#[cfg(target_os = "linux")]
fn verify_start_time(pid: u32, launched_at: DateTime<Utc>) -> Result<()> {
    let Some(actual) = proc_start_time(pid) else {
        // Start time unreadable (procfs quirk); liveness already checked.
        debug!(pid, "process start time unavailable, skipping identity check");
        return Ok(());
    };

    let delta = (actual - launched_at).num_seconds().abs();
    if delta > START_TIME_TOLERANCE_SECS {
        return Err(AppError::Conflict(format!(
            "pid {pid} was recycled: process started at {actual}, expected {launched_at}"
        )));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn verify_start_time(_pid: u32, _launched_at: DateTime<Utc>) -> Result<()> {
    Ok(())
}

/// Read a process's start time from `/proc/{pid}/stat` (field 22, clock
/// ticks since boot) combined with `btime` from `/proc/stat`.
#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces; fields are counted after the
    // closing parenthesis.
    let after_comm = stat.rsplit_once(')')?.1;
    let starttime_ticks: u64 = after_comm.split_whitespace().nth(19)?.parse().ok()?;

    let boot = std::fs::read_to_string("/proc/stat").ok()?;
    let btime: i64 = boot
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    // starttime is measured in USER_HZ ticks, fixed at 100 on Linux.
    const PROC_TICKS_PER_SEC: u64 = 100;

    #[allow(clippy::cast_possible_wrap)]
    let start_secs = btime + (starttime_ticks / PROC_TICKS_PER_SEC) as i64;
    Utc.timestamp_opt(start_secs, 0).single()
}

/// Build the command used to launch a game process, applying the
/// environment allowlist.
#[must_use]
pub fn build_command(binary: &str, args: &[String]) -> Command {
    let mut command = Command::new(binary);
    for arg in args {
        command.arg(arg);
    }

    command.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            command.env(key, val);
        }
    }

    command
}
