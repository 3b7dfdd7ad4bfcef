//! Unit tests for deploy settings validation.

use world_warden::models::settings::{DeploySettings, SecurityLevel, SettingsUpdate};
use world_warden::AppError;

#[test]
fn seed_defaults_to_safe_validated_deployments() {
    let settings = DeploySettings::seed(4779);

    assert_eq!(settings.validation_port, 4779);
    assert_eq!(settings.validation_security, SecurityLevel::Safe);
    assert!(settings.require_api_validation);
    assert!(settings.project_name.is_none());
}

#[test]
fn zero_validation_port_is_rejected() {
    let update = SettingsUpdate {
        validation_port: Some(0),
        ..SettingsUpdate::default()
    };

    let err = update.validate().expect_err("zero port must fail");
    assert!(matches!(err, AppError::Invalid(_)));
}

#[test]
fn locked_security_level_is_rejected() {
    let update = SettingsUpdate {
        validation_security: Some(SecurityLevel::Locked),
        ..SettingsUpdate::default()
    };

    let err = update.validate().expect_err("locked level must fail");
    assert!(matches!(err, AppError::Invalid(_)));
}

#[test]
fn supported_values_pass_validation() {
    let update = SettingsUpdate {
        project_name: Some("colony".into()),
        validation_port: Some(4900),
        validation_security: Some(SecurityLevel::Trusted),
        require_api_validation: Some(false),
    };

    update.validate().expect("valid update");
}

#[test]
fn empty_update_is_valid() {
    SettingsUpdate::default().validate().expect("no-op update");
}

#[test]
fn security_levels_have_wire_spellings() {
    assert_eq!(SecurityLevel::Locked.as_str(), "locked");
    assert_eq!(SecurityLevel::Safe.as_str(), "safe");
    assert_eq!(SecurityLevel::Trusted.as_str(), "trusted");
}
