//! Persistence layer modules.

pub mod compile_job_repo;
pub mod db;
pub mod job_repo;
pub mod reattach_repo;
pub mod schema;
pub mod settings_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
