//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Control protocol I/O failure talking to the game process.
    Communication(String),
    /// No protocol response arrived before the deadline.
    Timeout(String),
    /// Cooperative cancellation was observed before completion.
    Cancelled(String),
    /// The game process exited when it was not asked to.
    ProcessCrashed(String),
    /// External compiler failure or failed validation handshake.
    Compile(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Referenced record was concurrently removed or already consumed.
    Conflict(String),
    /// Malformed input rejected before touching persisted state.
    Invalid(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Communication(msg) => write!(f, "communication: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::ProcessCrashed(msg) => write!(f, "process crashed: {msg}"),
            Self::Compile(msg) => write!(f, "compile: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
