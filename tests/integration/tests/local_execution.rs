//! End-to-end execution through the façade and the local engine.
//!
//! Each test needs a `python3` on `PATH` and returns early without one.

#![cfg(unix)]

use saferun_core::Policy;
use saferun_integration_tests::{fake_env, system_python};
use saferun_sandbox::{run, LocalEngine, RunOptions};
use serde_json::json;
use std::time::Instant;
use tempfile::TempDir;

fn engine() -> Option<(TempDir, LocalEngine)> {
    let python = system_python()?;
    let dir = TempDir::new().ok()?;
    let root = fake_env(&dir.path().join("env"), &python).ok()?;
    let engine = LocalEngine::builder(root).build().ok()?;
    Some((dir, engine))
}

#[tokio::test]
async fn test_inputs_and_result() {
    let Some((_dir, engine)) = engine() else { return };
    let options = RunOptions::new()
        .with_input_value("x", json!(3))
        .with_input_value("y", json!(4));

    let result = run("result = x + y", &engine, options).await.unwrap();
    assert!(result.ok, "{:?}", result.error);
    assert_eq!(result.result, Some(json!(7)));
}

#[tokio::test]
async fn test_stdout_and_result() {
    let Some((_dir, engine)) = engine() else { return };
    let result = run("print('hello')\nresult=123", &engine, RunOptions::new())
        .await
        .unwrap();
    assert!(result.stdout.contains("hello"));
    assert_eq!(result.result, Some(json!(123)));
}

#[tokio::test]
async fn test_timeout() {
    let Some((_dir, engine)) = engine() else { return };
    let options = RunOptions::new().with_policy(Policy::default().with_timeout_seconds(1));

    let started = Instant::now();
    let result = run("while True: pass", &engine, options).await.unwrap();
    assert!(!result.ok);
    assert!(result.timed_out);
    assert!(started.elapsed().as_secs_f64() < 5.0);
}

#[tokio::test]
async fn test_output_truncated() {
    let Some((_dir, engine)) = engine() else { return };
    let options = RunOptions::new().with_policy(Policy::default().with_max_output_kb(4));

    let result = run("print('a'*10240)", &engine, options).await.unwrap();
    assert!(result.stdout.len() <= 4096);
}

#[tokio::test]
async fn test_exit_codes() {
    let Some((_dir, engine)) = engine() else { return };

    let clean = run("exit(0)", &engine, RunOptions::new()).await.unwrap();
    assert!(clean.ok);
    assert_eq!(clean.exit_code, Some(0));

    let failed = run("exit(2)", &engine, RunOptions::new()).await.unwrap();
    assert!(!failed.ok);
    assert_eq!(failed.exit_code, Some(2));
}

#[tokio::test]
async fn test_blocked_import_named() {
    let Some((_dir, engine)) = engine() else { return };
    let result = run("import socket", &engine, RunOptions::new()).await.unwrap();
    assert!(!result.ok);
    assert!(result.error.unwrap().contains("socket"));

    let allowed = run("import math\nresult = math.floor(2.5)", &engine, RunOptions::new())
        .await
        .unwrap();
    assert_eq!(allowed.result, Some(json!(2)));
}

#[tokio::test]
async fn test_allow_mode_builtins() {
    let Some((_dir, engine)) = engine() else { return };
    let policy = Policy::allow().allow_builtin("len");

    let denied = run("result = abs(-1)", &engine, RunOptions::new().with_policy(policy.clone()))
        .await
        .unwrap();
    assert!(!denied.ok);

    let allowed = run("result = len('abc')", &engine, RunOptions::new().with_policy(policy))
        .await
        .unwrap();
    assert!(allowed.ok, "{:?}", allowed.error);
    assert_eq!(allowed.result, Some(json!(3)));
}

#[tokio::test]
async fn test_dynamic_import_denied_even_when_allowed() {
    let Some((_dir, engine)) = engine() else { return };
    let policy = Policy::allow().allow_import("importlib").allow_builtin("__import__");

    let result = run("import importlib", &engine, RunOptions::new().with_policy(policy))
        .await
        .unwrap();
    assert!(!result.ok);
}
