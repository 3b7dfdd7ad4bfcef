//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every server startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS job (
    id              TEXT PRIMARY KEY NOT NULL,
    description     TEXT NOT NULL,
    started_by      TEXT NOT NULL,
    cancel_right    INTEGER NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','running','completed','errored','cancelling','cancelled')),
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    stopped_at      TEXT,
    error_text      TEXT
);

CREATE TABLE IF NOT EXISTS compile_job (
    id              TEXT PRIMARY KEY NOT NULL,
    job_id          TEXT NOT NULL,
    commit_sha      TEXT NOT NULL,
    origin_commit_sha TEXT,
    output_dir      TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deploy_settings (
    id              INTEGER PRIMARY KEY CHECK(id = 1),
    project_name    TEXT,
    validation_port INTEGER NOT NULL,
    validation_security TEXT NOT NULL CHECK(validation_security IN ('locked','safe','trusted')),
    require_api_validation INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS reattach (
    id              INTEGER PRIMARY KEY CHECK(id = 1),
    pid             INTEGER NOT NULL,
    port            INTEGER NOT NULL,
    event_port      INTEGER NOT NULL,
    access_token    TEXT NOT NULL,
    dmb_dir         TEXT NOT NULL,
    launched_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_compile_job_job ON compile_job(job_id);
CREATE INDEX IF NOT EXISTS idx_job_status ON job(status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
