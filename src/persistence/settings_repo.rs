//! Deployment settings repository for `SQLite` persistence.
//!
//! The settings table holds at most one row. `save` reports whether a row
//! was actually updated so callers can distinguish a concurrent removal.

use std::sync::Arc;

use crate::models::settings::{DeploySettings, SecurityLevel};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for the deployment settings row.
#[derive(Clone)]
pub struct SettingsRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SettingsRow {
    project_name: Option<String>,
    validation_port: i64,
    validation_security: String,
    require_api_validation: i64,
}

impl SettingsRow {
    /// Convert a database row into the domain model.
    fn into_settings(self) -> Result<DeploySettings> {
        let validation_port = u16::try_from(self.validation_port)
            .map_err(|_| AppError::Db("validation_port out of range".into()))?;

        Ok(DeploySettings {
            project_name: self.project_name,
            validation_port,
            validation_security: parse_security_level(&self.validation_security)?,
            require_api_validation: self.require_api_validation != 0,
        })
    }
}

fn parse_security_level(s: &str) -> Result<SecurityLevel> {
    match s {
        "locked" => Ok(SecurityLevel::Locked),
        "safe" => Ok(SecurityLevel::Safe),
        "trusted" => Ok(SecurityLevel::Trusted),
        other => Err(AppError::Db(format!("invalid security level: {other}"))),
    }
}

fn security_level_str(s: SecurityLevel) -> &'static str {
    match s {
        SecurityLevel::Locked => "locked",
        SecurityLevel::Safe => "safe",
        SecurityLevel::Trusted => "trusted",
    }
}

impl SettingsRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Retrieve the settings row.
    ///
    /// Returns `Ok(None)` if the row has been removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self) -> Result<Option<DeploySettings>> {
        let row: Option<SettingsRow> =
            sqlx::query_as("SELECT * FROM deploy_settings WHERE id = 1")
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(SettingsRow::into_settings).transpose()
    }

    /// Insert the settings row if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn seed_if_missing(&self, settings: &DeploySettings) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO deploy_settings
             (id, project_name, validation_port, validation_security, require_api_validation)
             VALUES (1, ?1, ?2, ?3, ?4)",
        )
        .bind(&settings.project_name)
        .bind(i64::from(settings.validation_port))
        .bind(security_level_str(settings.validation_security))
        .bind(i64::from(settings.require_api_validation))
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Overwrite the settings row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the row was concurrently removed,
    /// or `AppError::Db` if the update fails.
    pub async fn save(&self, settings: &DeploySettings) -> Result<()> {
        let result = sqlx::query(
            "UPDATE deploy_settings SET project_name = ?1, validation_port = ?2,
             validation_security = ?3, require_api_validation = ?4
             WHERE id = 1",
        )
        .bind(&settings.project_name)
        .bind(i64::from(settings.validation_port))
        .bind(security_level_str(settings.validation_security))
        .bind(i64::from(settings.require_api_validation))
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(
                "deployment settings were concurrently removed".into(),
            ));
        }

        Ok(())
    }

    /// Remove the settings row. Test use only.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self) -> Result<()> {
        sqlx::query("DELETE FROM deploy_settings WHERE id = 1")
            .execute(self.db.as_ref())
            .await?;

        Ok(())
    }
}
