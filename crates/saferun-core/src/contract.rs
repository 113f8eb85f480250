//! Execution contract shared by every backend.
//!
//! [`ExecutionRequest`] goes in, [`WorkerPayload`] crosses the worker
//! boundary on stdin, [`WorkerEnvelope`] comes back, and every backend
//! reports a uniform [`ExecutionResult`].

use crate::gate::{AdmittedNamespace, CapabilityGate, SymbolRule};
use crate::policy::{Policy, ALWAYS_BLOCKED_IMPORTS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A snippet plus everything needed to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Snippet source text.
    pub code: String,

    /// Structured input; bound as `input_data` and one variable per key.
    #[serde(default)]
    pub input_data: Option<Map<String, Value>>,

    /// Effective, validated policy.
    pub policy: Policy,
}

impl ExecutionRequest {
    /// Create a request with the given policy and no input.
    pub fn new(code: impl Into<String>, policy: Policy) -> Self {
        Self {
            code: code.into(),
            input_data: None,
            policy,
        }
    }

    /// Attach an input mapping.
    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input_data = Some(input);
        self
    }

    /// Build the wire payload for a worker.
    pub fn to_payload(&self) -> WorkerPayload {
        WorkerPayload::from_request(self)
    }
}

/// Request as serialised onto a worker's stdin.
///
/// Untrusted values travel here, never inside generated source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub code: String,
    pub globals: Map<String, Value>,
    pub imports: SymbolRule,
    pub builtins: SymbolRule,
    pub always_blocked_imports: Vec<String>,
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
}

impl WorkerPayload {
    /// Admit the namespace and serialise the symbol tables for `request`.
    pub fn from_request(request: &ExecutionRequest) -> Self {
        let gate = CapabilityGate::new(&request.policy);
        let namespace = AdmittedNamespace::build(&request.policy, request.input_data.as_ref());

        Self {
            code: request.code.clone(),
            globals: namespace.globals,
            imports: gate.import_rule().clone(),
            builtins: gate.builtin_rule().clone(),
            always_blocked_imports: ALWAYS_BLOCKED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            memory_limit_mb: request.policy.memory_limit_mb,
            max_output_bytes: request.policy.max_output_bytes(),
        }
    }

    /// Serialise to the JSON line written on stdin.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// How a worker-side failure came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Forbidden import or builtin.
    Policy,
    /// Uncaught exception in the snippet.
    Exception,
    /// Snippet failed to compile.
    Syntax,
    /// Explicit non-zero exit.
    Exit,
    /// Allocation failure under the memory ceiling.
    Memory,
    /// The shim itself failed.
    Internal,
}

/// Structured report written by the worker shim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub error_kind: Option<ErrorKind>,

    #[serde(default)]
    pub resource_exceeded: bool,

    /// Status the snippet asked for via `SystemExit`, which may fall outside
    /// what a process can report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl WorkerEnvelope {
    /// Parse the envelope from raw worker output.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw.trim())
    }
}

/// Uniform result of one execution.
///
/// Invariant: `ok` is true iff the worker exited 0 without a policy
/// violation, timeout, or memory overrun; `error` is set iff `ok` is false.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub timed_out: bool,

    #[serde(default)]
    pub resource_exceeded: bool,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Result for a run killed at its deadline.
    pub fn timed_out(timeout_seconds: u64) -> Self {
        Self {
            ok: false,
            timed_out: true,
            error: Some(format!("Execution timed out after {}s", timeout_seconds)),
            ..Default::default()
        }
    }

    /// Result for a run that never reached the snippet.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Result for a run killed by the memory ceiling.
    pub fn memory_exceeded(exit_code: Option<i32>) -> Self {
        Self {
            ok: false,
            resource_exceeded: true,
            error: Some("Memory limit exceeded".to_string()),
            exit_code,
            ..Default::default()
        }
    }

    /// Enforce the result invariants and cap both output streams.
    pub fn finalize(mut self, max_output_bytes: usize) -> Self {
        if self.timed_out || self.resource_exceeded {
            self.ok = false;
        }
        if self.exit_code.is_some_and(|code| code != 0) {
            self.ok = false;
        }

        if self.ok {
            self.error = None;
        } else if self.error.as_deref().map_or(true, str::is_empty) {
            self.error = Some(match self.exit_code {
                Some(code) => format!("Worker exited with status {}", code),
                None => "Execution failed".to_string(),
            });
        }

        truncate_utf8(&mut self.stdout, max_output_bytes);
        truncate_utf8(&mut self.stderr, max_output_bytes);
        self
    }
}

/// Truncate `s` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyMode;
    use serde_json::json;

    #[test]
    fn test_payload_from_request() {
        let request = ExecutionRequest::new("result = x + y", Policy::default())
            .with_input(json!({"x": 3, "y": 4}).as_object().cloned().unwrap());
        let payload = request.to_payload();

        assert_eq!(payload.code, "result = x + y");
        assert_eq!(payload.globals["x"], 3);
        assert_eq!(payload.imports.mode, PolicyMode::Restrict);
        assert!(payload.imports.names.contains("os"));
        assert!(payload.builtins.names.contains("eval"));
        assert_eq!(payload.always_blocked_imports, vec!["importlib".to_string()]);
        assert_eq!(payload.max_output_bytes, 128 * 1024);
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = ExecutionRequest::new("pass", Policy::allow().allow_import("math")).to_payload();
        let value: Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();

        assert_eq!(value["imports"]["mode"], "allow");
        assert_eq!(value["imports"]["names"], json!(["math"]));
        assert_eq!(value["memory_limit_mb"], 256);
    }

    #[test]
    fn test_envelope_parse() {
        let env = WorkerEnvelope::parse(
            r#"{"ok": false, "stdout": "", "stderr": "", "error": "ImportError: import 'os' is blocked by policy", "error_kind": "policy"}"#,
        )
        .unwrap();
        assert!(!env.ok);
        assert_eq!(env.error_kind, Some(ErrorKind::Policy));
        assert!(env.result.is_none());
    }

    #[test]
    fn test_finalize_sets_error_when_failed() {
        let result = ExecutionResult {
            ok: false,
            exit_code: Some(3),
            ..Default::default()
        }
        .finalize(1024);
        assert_eq!(result.error.as_deref(), Some("Worker exited with status 3"));
    }

    #[test]
    fn test_finalize_clears_error_when_ok() {
        let result = ExecutionResult {
            ok: true,
            exit_code: Some(0),
            error: Some("stale".to_string()),
            ..Default::default()
        }
        .finalize(1024);
        assert!(result.ok);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_finalize_nonzero_exit_is_failure() {
        let result = ExecutionResult {
            ok: true,
            exit_code: Some(2),
            ..Default::default()
        }
        .finalize(1024);
        assert!(!result.ok);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_finalize_truncates_output() {
        let result = ExecutionResult {
            ok: true,
            stdout: "a".repeat(10_240),
            stderr: "é".repeat(3000),
            ..Default::default()
        }
        .finalize(4096);
        assert_eq!(result.stdout.len(), 4096);
        assert!(result.stderr.len() <= 4096);
        assert!(result.stderr.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_timed_out_result() {
        let result = ExecutionResult::timed_out(1).finalize(1024);
        assert!(!result.ok);
        assert!(result.timed_out);
        assert!(result.exit_code.is_none());
        assert_eq!(result.error.as_deref(), Some("Execution timed out after 1s"));
    }
}
