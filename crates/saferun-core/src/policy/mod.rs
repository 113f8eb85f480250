//! Execution policy for untrusted snippets.
//!
//! A [`Policy`] is constructed once per call (or loaded from a TOML file),
//! validated, and then treated as immutable. It crosses the worker boundary
//! in serialised form only.

mod loader;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Imports that are denied in every mode, regardless of allow-lists.
///
/// `importlib` gives a snippet a reflective path around the import hook.
pub const ALWAYS_BLOCKED_IMPORTS: &[&str] = &["importlib"];

/// Enforcement mode. Exactly one is active per execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Everything is reachable except the blocked lists.
    #[default]
    Restrict,

    /// Nothing is reachable except the allowed lists.
    Allow,
}

impl PolicyMode {
    /// Lowercase name used on the wire and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restrict => "restrict",
            Self::Allow => "allow",
        }
    }
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability and resource restrictions for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Enforcement mode.
    #[serde(default)]
    pub mode: PolicyMode,

    /// Wall-clock deadline in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Address-space ceiling in megabytes.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    /// Per-stream output cap in kilobytes.
    #[serde(default = "default_max_output_kb")]
    pub max_output_kb: u64,

    /// Imports reachable in allow mode.
    #[serde(default)]
    pub allowed_imports: BTreeSet<String>,

    /// Imports denied in restrict mode.
    #[serde(default = "default_blocked_imports")]
    pub blocked_imports: BTreeSet<String>,

    /// Builtins reachable in allow mode.
    #[serde(default)]
    pub allowed_builtins: BTreeSet<String>,

    /// Builtins denied in restrict mode.
    #[serde(default = "default_blocked_builtins")]
    pub blocked_builtins: BTreeSet<String>,

    /// Global names injectable in allow mode.
    #[serde(default)]
    pub allowed_globals: BTreeSet<String>,

    /// Global names never injected in restrict mode.
    #[serde(default)]
    pub blocked_globals: BTreeSet<String>,

    /// Extra values injected into the snippet namespace.
    #[serde(default)]
    pub extra_globals: Map<String, Value>,
}

fn default_timeout_seconds() -> u64 {
    5
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_max_output_kb() -> u64 {
    128
}

fn default_blocked_imports() -> BTreeSet<String> {
    names(&["os", "subprocess", "socket", "ctypes", "importlib", "sys"])
}

fn default_blocked_builtins() -> BTreeSet<String> {
    names(&["eval", "exec", "open", "compile", "breakpoint"])
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Restrict,
            timeout_seconds: default_timeout_seconds(),
            memory_limit_mb: default_memory_limit_mb(),
            max_output_kb: default_max_output_kb(),
            allowed_imports: BTreeSet::new(),
            blocked_imports: default_blocked_imports(),
            allowed_builtins: BTreeSet::new(),
            blocked_builtins: default_blocked_builtins(),
            allowed_globals: BTreeSet::new(),
            blocked_globals: BTreeSet::new(),
            extra_globals: Map::new(),
        }
    }
}

impl Policy {
    /// Restrict-mode policy with the default blocked lists.
    pub fn restrict() -> Self {
        Self::default()
    }

    /// Allow-mode policy with empty allow-lists (nothing reachable).
    pub fn allow() -> Self {
        Self {
            mode: PolicyMode::Allow,
            ..Default::default()
        }
    }

    /// Builder-style method to set the wall-clock timeout.
    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    /// Builder-style method to set the memory ceiling.
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Builder-style method to set the output cap.
    pub fn with_max_output_kb(mut self, kb: u64) -> Self {
        self.max_output_kb = kb;
        self
    }

    /// Add a name to `blocked_imports`.
    pub fn block_import(mut self, name: impl Into<String>) -> Self {
        self.blocked_imports.insert(name.into());
        self
    }

    /// Add a name to `allowed_imports`.
    pub fn allow_import(mut self, name: impl Into<String>) -> Self {
        self.allowed_imports.insert(name.into());
        self
    }

    /// Add a name to `blocked_builtins`.
    pub fn block_builtin(mut self, name: impl Into<String>) -> Self {
        self.blocked_builtins.insert(name.into());
        self
    }

    /// Add a name to `allowed_builtins`.
    pub fn allow_builtin(mut self, name: impl Into<String>) -> Self {
        self.allowed_builtins.insert(name.into());
        self
    }

    /// Add a name to `blocked_globals`.
    pub fn block_global(mut self, name: impl Into<String>) -> Self {
        self.blocked_globals.insert(name.into());
        self
    }

    /// Add a name to `allowed_globals`.
    pub fn allow_global(mut self, name: impl Into<String>) -> Self {
        self.allowed_globals.insert(name.into());
        self
    }

    /// Add an extra global value.
    pub fn with_extra_global(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_globals.insert(name.into(), value.into());
        self
    }

    /// Output cap in bytes.
    pub fn max_output_bytes(&self) -> usize {
        usize::try_from(self.max_output_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    /// Validate the policy, collecting all errors before returning.
    ///
    /// Only the lists of the active mode are inspected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.timeout_seconds == 0 {
            errors.push("timeout_seconds must be positive".to_string());
        }
        if self.memory_limit_mb == 0 {
            errors.push("memory_limit_mb must be positive".to_string());
        }
        if self.max_output_kb == 0 {
            errors.push("max_output_kb must be positive".to_string());
        }

        let active: [(&str, &BTreeSet<String>); 3] = match self.mode {
            PolicyMode::Restrict => [
                ("blocked_imports", &self.blocked_imports),
                ("blocked_builtins", &self.blocked_builtins),
                ("blocked_globals", &self.blocked_globals),
            ],
            PolicyMode::Allow => [
                ("allowed_imports", &self.allowed_imports),
                ("allowed_builtins", &self.allowed_builtins),
                ("allowed_globals", &self.allowed_globals),
            ],
        };
        for (field, set) in active {
            for name in set {
                if name.is_empty() || name.chars().any(char::is_whitespace) {
                    errors.push(format!("'{}' contains an invalid name: {:?}", field, name));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}
