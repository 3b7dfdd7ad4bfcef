#![forbid(unsafe_code)]

pub mod config;
pub mod deploy;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod persistence;
pub mod rights;
pub mod session;
pub mod watchdog;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
