//! Integration tests for deploy settings updates: validation before
//! persistence, per-field rights, and concurrent-removal handling.

use world_warden::models::settings::{SecurityLevel, SettingsUpdate};
use world_warden::persistence::settings_repo::SettingsRepo;
use world_warden::rights::{
    Rights, DEPLOY_READ, DEPLOY_SET_PROJECT, DEPLOY_SET_VALIDATION_PORT,
};
use world_warden::AppError;

use super::test_helpers::{build_stack, test_config, Stack};

const ALL_RIGHTS: Rights = Rights(u64::MAX);

async fn settings_stack() -> Stack {
    let data = tempfile::tempdir().expect("tempdir");
    let repo = tempfile::tempdir().expect("tempdir");
    let stack = build_stack(test_config(data.path(), repo.path(), "sleep", &["600"])).await;
    // The tempdirs may drop; settings tests never touch the filesystem.
    stack
}

#[tokio::test]
async fn zero_port_is_rejected_before_any_persisted_change() {
    let stack = settings_stack().await;
    let before = stack
        .pipeline
        .read_settings(ALL_RIGHTS)
        .await
        .expect("read");

    let err = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                validation_port: Some(0),
                project_name: Some("colony".into()),
                ..SettingsUpdate::default()
            },
            ALL_RIGHTS,
        )
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::Invalid(_)));

    let after = stack
        .pipeline
        .read_settings(ALL_RIGHTS)
        .await
        .expect("read");
    assert_eq!(after, before, "no field may change on a rejected update");
}

#[tokio::test]
async fn lowest_security_level_is_rejected_before_any_persisted_change() {
    let stack = settings_stack().await;
    let before = stack
        .pipeline
        .read_settings(ALL_RIGHTS)
        .await
        .expect("read");

    let err = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                validation_security: Some(SecurityLevel::Locked),
                ..SettingsUpdate::default()
            },
            ALL_RIGHTS,
        )
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::Invalid(_)));

    let after = stack
        .pipeline
        .read_settings(ALL_RIGHTS)
        .await
        .expect("read");
    assert_eq!(after, before);
}

#[tokio::test]
async fn each_field_is_authorized_independently() {
    let stack = settings_stack().await;

    // Port right alone cannot change the project name.
    let err = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                project_name: Some("colony".into()),
                ..SettingsUpdate::default()
            },
            DEPLOY_SET_VALIDATION_PORT,
        )
        .await
        .expect_err("must be denied");
    assert!(matches!(err, AppError::Unauthorized(_)));

    // But it can change the port, holding nothing else.
    let updated = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                validation_port: Some(4999),
                ..SettingsUpdate::default()
            },
            DEPLOY_SET_VALIDATION_PORT,
        )
        .await
        .expect("apply");
    assert_eq!(updated.validation_port, 4999);
}

#[tokio::test]
async fn project_name_applies_and_an_empty_string_clears_it() {
    let stack = settings_stack().await;

    let updated = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                project_name: Some("colony".into()),
                ..SettingsUpdate::default()
            },
            DEPLOY_SET_PROJECT,
        )
        .await
        .expect("apply");
    assert_eq!(updated.project_name.as_deref(), Some("colony"));

    let cleared = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                project_name: Some(String::new()),
                ..SettingsUpdate::default()
            },
            DEPLOY_SET_PROJECT,
        )
        .await
        .expect("clear");
    assert!(cleared.project_name.is_none());
}

#[tokio::test]
async fn update_after_concurrent_removal_is_a_conflict() {
    let stack = settings_stack().await;

    SettingsRepo::new(std::sync::Arc::clone(&stack.db))
        .delete()
        .await
        .expect("remove row");

    let err = stack
        .pipeline
        .update_settings(
            SettingsUpdate {
                validation_port: Some(4999),
                ..SettingsUpdate::default()
            },
            ALL_RIGHTS,
        )
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn reading_settings_requires_the_read_right() {
    let stack = settings_stack().await;

    let err = stack
        .pipeline
        .read_settings(Rights::NONE)
        .await
        .expect_err("must be denied");
    assert!(matches!(err, AppError::Unauthorized(_)));

    let settings = stack.pipeline.read_settings(DEPLOY_READ).await.expect("read");
    assert_eq!(
        settings.validation_port,
        stack.config.deploy.default_validation_port
    );
}
