//! Engine façade.
//!
//! [`run`] resolves the effective policy, then hands the request to exactly
//! one engine. Configuration mistakes are returned as `Err` before anything
//! starts; everything that happens to the snippet comes back in the
//! `ExecutionResult`.

use crate::engine::ExecutionEngine;
use saferun_core::{ConfigError, ExecutionRequest, ExecutionResult, Policy};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Optional inputs to [`run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Variables bound in the snippet's namespace.
    pub input_data: Option<Map<String, Value>>,

    /// Policy object. Mutually exclusive with `policy_file`.
    pub policy: Option<Policy>,

    /// Policy TOML file. Mutually exclusive with `policy`.
    pub policy_file: Option<PathBuf>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input_data = Some(input);
        self
    }

    /// Bind a single input variable.
    pub fn with_input_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.input_data
            .get_or_insert_with(Map::new)
            .insert(name.into(), value);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_policy_file(mut self, path: impl AsRef<Path>) -> Self {
        self.policy_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// The policy this run will use.
    pub fn resolve_policy(&self) -> Result<Policy, ConfigError> {
        let policy = match (&self.policy, &self.policy_file) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::conflicting(
                    "pass either a policy or a policy file, not both",
                ))
            }
            (Some(policy), None) => policy.clone(),
            (None, Some(path)) => Policy::from_file(path)?,
            (None, None) => Policy::default(),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Run `code` on `engine` under the resolved policy.
pub async fn run(
    code: &str,
    engine: &dyn ExecutionEngine,
    options: RunOptions,
) -> Result<ExecutionResult, ConfigError> {
    let policy = options.resolve_policy()?;

    let mut request = ExecutionRequest::new(code, policy);
    if let Some(input) = options.input_data {
        request = request.with_input(input);
    }

    debug!(engine = engine.name(), "Dispatching snippet");
    let result = engine.dispatch(&request).await;
    debug!(
        engine = engine.name(),
        ok = result.ok,
        elapsed_ms = result.duration_ms,
        "Snippet finished"
    );
    Ok(result)
}

/// Blocking wrapper around [`run`] for synchronous callers.
///
/// Must not be called from inside a tokio runtime.
pub fn run_blocking(
    code: &str,
    engine: &dyn ExecutionEngine,
    options: RunOptions,
) -> Result<ExecutionResult, ConfigError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(code, engine, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingEngine {
        seen: Mutex<Vec<ExecutionRequest>>,
    }

    #[async_trait]
    impl ExecutionEngine for RecordingEngine {
        fn name(&self) -> &str {
            "recording"
        }

        async fn dispatch(&self, request: &ExecutionRequest) -> ExecutionResult {
            self.seen.lock().push(request.clone());
            ExecutionResult {
                ok: true,
                result: Some(json!(7)),
                exit_code: Some(0),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_default_policy_and_inputs() {
        let engine = RecordingEngine::default();
        let options = RunOptions::new()
            .with_input_value("x", json!(3))
            .with_input_value("y", json!(4));

        let result = run("result = x + y", &engine, options).await.unwrap();
        assert!(result.ok);

        let seen = engine.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].policy, Policy::default());
        let input = seen[0].input_data.as_ref().unwrap();
        assert_eq!(input["x"], json!(3));
        assert_eq!(input["y"], json!(4));
    }

    #[tokio::test]
    async fn test_policy_and_file_conflict() {
        let engine = RecordingEngine::default();
        let options = RunOptions::new()
            .with_policy(Policy::default())
            .with_policy_file("/tmp/policy.toml");

        let err = run("result = 1", &engine, options).await.unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingOptions(_)));
        assert!(engine.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_policy_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "timeout_seconds = 9\nmax_output_kb = 4\n").unwrap();

        let engine = RecordingEngine::default();
        run("result = 1", &engine, RunOptions::new().with_policy_file(&path))
            .await
            .unwrap();

        let seen = engine.seen.lock();
        assert_eq!(seen[0].policy.timeout_seconds, 9);
        assert_eq!(seen[0].policy.max_output_kb, 4);
    }

    #[tokio::test]
    async fn test_missing_policy_file() {
        let engine = RecordingEngine::default();
        let options = RunOptions::new().with_policy_file("/nonexistent/saferun/policy.toml");
        let err = run("result = 1", &engine, options).await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected_before_dispatch() {
        let engine = RecordingEngine::default();
        let options = RunOptions::new().with_policy(Policy::default().with_timeout_seconds(0));
        let err = run("result = 1", &engine, options).await.unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(engine.seen.lock().is_empty());
    }

    #[test]
    fn test_run_blocking() {
        let engine = RecordingEngine::default();
        let result = run_blocking("result = 7", &engine, RunOptions::new()).unwrap();
        assert_eq!(result.result, Some(json!(7)));
    }
}
