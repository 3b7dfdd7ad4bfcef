//! Deployment settings model and update validation.

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Security level applied to the validation session.
///
/// `Locked` is the most restrictive level the engine offers; its sandbox
/// blocks the interop calls the validation handshake depends on, so it is
/// rejected at the settings boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Most restrictive engine sandbox. Not supported for validation.
    Locked,
    /// Default engine sandbox.
    Safe,
    /// No engine sandbox.
    Trusted,
}

impl SecurityLevel {
    /// Wire/env spelling of the level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Safe => "safe",
            Self::Trusted => "trusted",
        }
    }
}

/// Persisted deployment settings. One row per host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeploySettings {
    /// Project name passed to the compiler; `None` compiles the default.
    pub project_name: Option<String>,
    /// Port the validation session listens on.
    pub validation_port: u16,
    /// Security level applied to the validation session.
    pub validation_security: SecurityLevel,
    /// Whether a deployment fails without a successful handshake.
    pub require_api_validation: bool,
}

impl DeploySettings {
    /// Settings seeded on first startup.
    #[must_use]
    pub fn seed(validation_port: u16) -> Self {
        Self {
            project_name: None,
            validation_port,
            validation_security: SecurityLevel::Safe,
            require_api_validation: true,
        }
    }
}

/// A partial settings update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SettingsUpdate {
    /// New project name; empty string clears it.
    pub project_name: Option<String>,
    /// New validation port.
    pub validation_port: Option<u16>,
    /// New validation security level.
    pub validation_security: Option<SecurityLevel>,
    /// New validation requirement flag.
    pub require_api_validation: Option<bool>,
}

impl SettingsUpdate {
    /// Reject malformed values before any persisted state is touched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Invalid` for a zero validation port or the
    /// unsupported `Locked` security level.
    pub fn validate(&self) -> Result<()> {
        if self.validation_port == Some(0) {
            return Err(AppError::Invalid("validation port cannot be 0".into()));
        }

        if self.validation_security == Some(SecurityLevel::Locked) {
            return Err(AppError::Invalid(
                "the locked security level is not supported for validation".into(),
            ));
        }

        Ok(())
    }
}
