//! Unit tests for the application error taxonomy.

use world_warden::AppError;

#[test]
fn display_prefixes_name_each_domain() {
    let cases = [
        (AppError::Communication("x".into()), "communication: x"),
        (AppError::Timeout("x".into()), "timeout: x"),
        (AppError::Cancelled("x".into()), "cancelled: x"),
        (AppError::ProcessCrashed("x".into()), "process crashed: x"),
        (AppError::Compile("x".into()), "compile: x"),
        (AppError::Unauthorized("x".into()), "unauthorized: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::Conflict("x".into()), "conflict: x"),
        (AppError::Invalid("x".into()), "invalid: x"),
        (AppError::Config("x".into()), "config: x"),
        (AppError::Db("x".into()), "db: x"),
        (AppError::Io("x".into()), "io: x"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_error_converts() {
    let io = std::io::Error::other("boom");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(_)));
}

#[test]
fn toml_error_converts_to_config() {
    let parse_err = toml::from_str::<toml::Value>("= broken").expect_err("must fail");
    let err: AppError = parse_err.into();
    assert!(matches!(err, AppError::Config(_)));
}
