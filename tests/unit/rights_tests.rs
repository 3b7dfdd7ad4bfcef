//! Unit tests for the capability bitmask and the settings rights table.

use world_warden::rights::{
    required_right, Rights, SettingsField, DEPLOY_CANCEL_COMPILE, DEPLOY_COMPILE, DEPLOY_READ,
    DEPLOY_SET_PROJECT, DEPLOY_SET_SECURITY_LEVEL, DEPLOY_SET_VALIDATION_PORT,
    DEPLOY_SET_VALIDATION_REQUIREMENT, SETTINGS_FIELD_RIGHTS,
};
use world_warden::AppError;

#[test]
fn has_requires_every_bit() {
    let caller = DEPLOY_READ.with(DEPLOY_COMPILE);

    assert!(caller.has(DEPLOY_READ));
    assert!(caller.has(DEPLOY_COMPILE));
    assert!(caller.has(DEPLOY_READ.with(DEPLOY_COMPILE)));
    assert!(!caller.has(DEPLOY_CANCEL_COMPILE));
    assert!(!caller.has(DEPLOY_COMPILE.with(DEPLOY_CANCEL_COMPILE)));
}

#[test]
fn none_holds_nothing_but_the_empty_set() {
    assert!(Rights::NONE.has(Rights::NONE));
    assert!(!Rights::NONE.has(DEPLOY_READ));
}

#[test]
fn ensure_names_the_denied_action() {
    let err = Rights::NONE
        .ensure(DEPLOY_COMPILE, "start a deployment")
        .expect_err("must be denied");

    match err {
        AppError::Unauthorized(msg) => assert!(msg.contains("start a deployment")),
        other => panic!("expected Unauthorized, got {other}"),
    }
}

#[test]
fn every_settings_field_has_a_distinct_right() {
    let fields = [
        SettingsField::ProjectName,
        SettingsField::ValidationPort,
        SettingsField::SecurityLevel,
        SettingsField::RequireApiValidation,
    ];

    assert_eq!(SETTINGS_FIELD_RIGHTS.len(), fields.len());

    for field in fields {
        let right = required_right(field);
        assert_ne!(right, Rights::NONE, "{field:?} must be gated");
    }

    assert_ne!(
        required_right(SettingsField::ProjectName),
        required_right(SettingsField::ValidationPort)
    );
}

#[test]
fn field_table_matches_named_constants() {
    assert_eq!(required_right(SettingsField::ProjectName), DEPLOY_SET_PROJECT);
    assert_eq!(
        required_right(SettingsField::ValidationPort),
        DEPLOY_SET_VALIDATION_PORT
    );
    assert_eq!(
        required_right(SettingsField::SecurityLevel),
        DEPLOY_SET_SECURITY_LEVEL
    );
    assert_eq!(
        required_right(SettingsField::RequireApiValidation),
        DEPLOY_SET_VALIDATION_REQUIREMENT
    );
}
