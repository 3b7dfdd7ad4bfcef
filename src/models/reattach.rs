//! Reattach snapshot letting a new controller adopt a live process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything needed to reconstruct a [`crate::session::SessionController`]
/// around an already-running game process after a host restart.
///
/// Valid only while `pid` and `launched_at` still describe the same live
/// process; a recycled pid fails the launch-timestamp check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReattachInformation {
    /// Process id of the running game server.
    pub pid: u32,
    /// Port its control endpoint listens on.
    pub port: u16,
    /// Port of the host-side event listener the process reports to.
    pub event_port: u16,
    /// Access token embedded in every protocol exchange.
    pub access_token: String,
    /// Primary directory of the build the process is running.
    pub dmb_dir: String,
    /// Timestamp the process was originally launched.
    pub launched_at: DateTime<Utc>,
}
