//! Reattach snapshot repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::reattach::ReattachInformation;
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for the reattach snapshot row.
#[derive(Clone)]
pub struct ReattachRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ReattachRow {
    pid: i64,
    port: i64,
    event_port: i64,
    access_token: String,
    dmb_dir: String,
    launched_at: String,
}

impl ReattachRow {
    /// Convert a database row into the domain model.
    fn into_reattach(self) -> Result<ReattachInformation> {
        let launched_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&self.launched_at)
            .map_err(|e| AppError::Db(format!("invalid launched_at: {e}")))?
            .with_timezone(&Utc);

        Ok(ReattachInformation {
            pid: u32::try_from(self.pid).map_err(|_| AppError::Db("pid out of range".into()))?,
            port: u16::try_from(self.port)
                .map_err(|_| AppError::Db("port out of range".into()))?,
            event_port: u16::try_from(self.event_port)
                .map_err(|_| AppError::Db("event_port out of range".into()))?,
            access_token: self.access_token,
            dmb_dir: self.dmb_dir,
            launched_at,
        })
    }
}

impl ReattachRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store the snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn save(&self, info: &ReattachInformation) -> Result<()> {
        sqlx::query(
            "INSERT INTO reattach (id, pid, port, event_port, access_token, dmb_dir, launched_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 pid = excluded.pid,
                 port = excluded.port,
                 event_port = excluded.event_port,
                 access_token = excluded.access_token,
                 dmb_dir = excluded.dmb_dir,
                 launched_at = excluded.launched_at",
        )
        .bind(i64::from(info.pid))
        .bind(i64::from(info.port))
        .bind(i64::from(info.event_port))
        .bind(&info.access_token)
        .bind(&info.dmb_dir)
        .bind(info.launched_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Load the stored snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn load(&self) -> Result<Option<ReattachInformation>> {
        let row: Option<ReattachRow> = sqlx::query_as("SELECT * FROM reattach WHERE id = 1")
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(ReattachRow::into_reattach).transpose()
    }

    /// Discard the stored snapshot once it has been consumed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM reattach WHERE id = 1")
            .execute(self.db.as_ref())
            .await?;

        Ok(())
    }
}
