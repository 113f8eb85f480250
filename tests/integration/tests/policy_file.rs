//! Policy file integration tests.
//!
//! Policies written to disk load back identically and feed the façade.

use saferun_core::{ConfigError, Policy, PolicyMode};
use std::path::Path;
use tempfile::TempDir;

#[test]
fn test_policy_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("policy.toml");

    let policy = Policy::allow()
        .with_timeout_seconds(3)
        .allow_import("math")
        .allow_builtin("print")
        .allow_global("rate")
        .with_extra_global("rate", 0.25);
    policy.save(&path).unwrap();

    let loaded = Policy::from_file(&path).unwrap();
    assert_eq!(loaded, policy);
    assert_eq!(loaded.mode, PolicyMode::Allow);
}

#[test]
fn test_policy_nested_table() {
    let policy = Policy::from_toml_str(
        r#"
        [policy]
        mode = "restrict"
        max_output_kb = 4
        blocked_imports = ["os", "json"]

        [policy.extra_globals]
        limit = 10
        "#,
    )
    .unwrap();

    assert_eq!(policy.max_output_bytes(), 4096);
    assert!(policy.blocked_imports.contains("json"));
    assert_eq!(policy.extra_globals["limit"], 10);
}

#[test]
fn test_policy_unknown_key_rejected() {
    let err = Policy::from_toml_str("timeout = 5\n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_policy_load_nonexistent() {
    let err = Policy::from_file(Path::new("/nonexistent/policy.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(_)));
}
