//! Capability bitmask rights and the deploy-settings rights table.
//!
//! Every mutable deployment-settings field maps to exactly one right in
//! [`SETTINGS_FIELD_RIGHTS`]; callers check through [`Rights::ensure`] so
//! no per-field bitmask logic leaks into the pipeline.

use crate::{AppError, Result};

/// Capability set held by a caller, as a flat bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rights(pub u64);

/// Read deployment status and compile job records.
pub const DEPLOY_READ: Rights = Rights(1 << 0);
/// Start a deployment compile job.
pub const DEPLOY_COMPILE: Rights = Rights(1 << 1);
/// Cancel a running deployment compile job.
pub const DEPLOY_CANCEL_COMPILE: Rights = Rights(1 << 2);
/// Change the project name compiled by deployments.
pub const DEPLOY_SET_PROJECT: Rights = Rights(1 << 3);
/// Change the port used for the api validation handshake.
pub const DEPLOY_SET_VALIDATION_PORT: Rights = Rights(1 << 4);
/// Change the security level applied during validation.
pub const DEPLOY_SET_SECURITY_LEVEL: Rights = Rights(1 << 5);
/// Toggle whether deployments require a successful validation handshake.
pub const DEPLOY_SET_VALIDATION_REQUIREMENT: Rights = Rights(1 << 6);

impl Rights {
    /// Empty capability set.
    pub const NONE: Self = Self(0);

    /// Whether every bit of `required` is present in this set.
    #[must_use]
    pub fn has(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }

    /// Union of two capability sets.
    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check that this set holds `required`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` naming the denied action.
    pub fn ensure(self, required: Self, action: &str) -> Result<()> {
        if self.has(required) {
            Ok(())
        } else {
            Err(AppError::Unauthorized(format!(
                "caller lacks the right to {action}"
            )))
        }
    }
}

/// Mutable deployment-settings fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    /// The project name compiled by deployments.
    ProjectName,
    /// The api validation port.
    ValidationPort,
    /// The api validation security level.
    SecurityLevel,
    /// Whether a successful validation handshake is required.
    RequireApiValidation,
}

/// Required right for each mutable deployment-settings field.
pub const SETTINGS_FIELD_RIGHTS: &[(SettingsField, Rights)] = &[
    (SettingsField::ProjectName, DEPLOY_SET_PROJECT),
    (SettingsField::ValidationPort, DEPLOY_SET_VALIDATION_PORT),
    (SettingsField::SecurityLevel, DEPLOY_SET_SECURITY_LEVEL),
    (
        SettingsField::RequireApiValidation,
        DEPLOY_SET_VALIDATION_REQUIREMENT,
    ),
];

/// Look up the right guarding a settings field.
#[must_use]
pub fn required_right(field: SettingsField) -> Rights {
    SETTINGS_FIELD_RIGHTS
        .iter()
        .find(|(f, _)| *f == field)
        .map_or(Rights::NONE, |(_, right)| *right)
}
