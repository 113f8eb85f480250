//! Capability gate.
//!
//! The gate turns a [`Policy`] into closed symbol tables over imports,
//! builtins, and global names. Globals are filtered here, before a worker
//! starts. Import and builtin tables are serialised into the worker payload
//! and enforced by the shim inside the interpreter.

use crate::policy::{Policy, PolicyMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Names an input key may never bind.
pub const RESERVED_GLOBALS: &[&str] = &["__builtins__", "input_data", "result"];

/// Variable holding the whole input mapping.
pub const INPUT_DATA_GLOBAL: &str = "input_data";

/// One closed symbol table.
///
/// In restrict mode `names` is the denylist, in allow mode it is the allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRule {
    pub mode: PolicyMode,
    pub names: BTreeSet<String>,
}

impl SymbolRule {
    fn for_mode(mode: PolicyMode, allowed: &BTreeSet<String>, blocked: &BTreeSet<String>) -> Self {
        let names = match mode {
            PolicyMode::Restrict => blocked.clone(),
            PolicyMode::Allow => allowed.clone(),
        };
        Self { mode, names }
    }

    /// Whether `name` passes this rule.
    pub fn permits(&self, name: &str) -> bool {
        match self.mode {
            PolicyMode::Restrict => !self.names.contains(name),
            PolicyMode::Allow => self.names.contains(name),
        }
    }
}

/// Closed symbol tables for one policy.
#[derive(Debug, Clone)]
pub struct CapabilityGate {
    imports: SymbolRule,
    builtins: SymbolRule,
    globals: SymbolRule,
}

impl CapabilityGate {
    /// Build the symbol tables for a policy.
    pub fn new(policy: &Policy) -> Self {
        Self {
            imports: SymbolRule::for_mode(
                policy.mode,
                &policy.allowed_imports,
                &policy.blocked_imports,
            ),
            builtins: SymbolRule::for_mode(
                policy.mode,
                &policy.allowed_builtins,
                &policy.blocked_builtins,
            ),
            globals: SymbolRule::for_mode(
                policy.mode,
                &policy.allowed_globals,
                &policy.blocked_globals,
            ),
        }
    }

    /// Import rule as sent to the worker.
    pub fn import_rule(&self) -> &SymbolRule {
        &self.imports
    }

    /// Builtin rule as sent to the worker.
    pub fn builtin_rule(&self) -> &SymbolRule {
        &self.builtins
    }

    /// Whether a global name may be injected into the namespace.
    pub fn admits_global(&self, name: &str) -> bool {
        self.globals.permits(name)
    }
}

/// Globals pre-filtered for one execution.
///
/// Filtering is silent: names the policy does not admit are dropped, never
/// reported as errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmittedNamespace {
    pub globals: Map<String, Value>,
}

impl AdmittedNamespace {
    /// Build the admitted globals from `extra_globals` and the input mapping.
    pub fn build(policy: &Policy, input: Option<&Map<String, Value>>) -> Self {
        let gate = CapabilityGate::new(policy);
        let mut globals = Map::new();

        for (key, value) in &policy.extra_globals {
            if gate.admits_global(key) {
                globals.insert(key.clone(), value.clone());
            }
        }

        let input_value = Value::Object(input.cloned().unwrap_or_default());
        if gate.admits_global(INPUT_DATA_GLOBAL) && !globals.contains_key(INPUT_DATA_GLOBAL) {
            globals.insert(INPUT_DATA_GLOBAL.to_string(), input_value);
        }

        if let Some(input) = input {
            for (key, value) in input {
                if !is_identifier(key) || key.starts_with('_') || RESERVED_GLOBALS.contains(&key.as_str()) {
                    continue;
                }
                if !gate.admits_global(key) || globals.contains_key(key) {
                    continue;
                }
                globals.insert(key.clone(), value.clone());
            }
        }

        Self { globals }
    }
}

/// Whether `name` is usable as a bare variable name.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => chars.all(|c| c == '_' || c.is_alphanumeric()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_restrict_rules_carry_blocklists() {
        let gate = CapabilityGate::new(&Policy::restrict().block_import("requests"));

        assert_eq!(gate.import_rule().mode, PolicyMode::Restrict);
        assert!(gate.import_rule().names.contains("requests"));
        assert!(!gate.import_rule().permits("requests"));
        assert!(gate.import_rule().permits("math"));
        assert!(!gate.builtin_rule().permits("open"));
        assert!(gate.builtin_rule().permits("len"));
    }

    #[test]
    fn test_allow_rules_carry_allowlists() {
        let policy = Policy::allow()
            .allow_import("math")
            .allow_builtin("len")
            .block_import("math");
        let gate = CapabilityGate::new(&policy);

        assert_eq!(gate.import_rule().mode, PolicyMode::Allow);
        assert_eq!(gate.import_rule().names, BTreeSet::from(["math".to_string()]));
        assert!(gate.import_rule().permits("math"));
        assert!(!gate.import_rule().permits("json"));
        assert!(gate.builtin_rule().permits("len"));
        assert!(!gate.builtin_rule().permits("print"));
    }

    #[test]
    fn test_namespace_restrict_binds_input_keys() {
        let data = input(json!({"x": 3, "y": 4}));
        let ns = AdmittedNamespace::build(&Policy::restrict(), Some(&data));

        assert_eq!(ns.globals["x"], 3);
        assert_eq!(ns.globals["y"], 4);
        assert_eq!(ns.globals["input_data"], json!({"x": 3, "y": 4}));
    }

    #[test]
    fn test_namespace_skips_reserved_and_private_keys() {
        let data = input(json!({
            "result": 1,
            "_hidden": 2,
            "not-an-ident": 3,
            "__builtins__": 4,
            "ok": 5
        }));
        let ns = AdmittedNamespace::build(&Policy::restrict(), Some(&data));

        assert!(!ns.globals.contains_key("result"));
        assert!(!ns.globals.contains_key("_hidden"));
        assert!(!ns.globals.contains_key("not-an-ident"));
        assert!(!ns.globals.contains_key("__builtins__"));
        assert_eq!(ns.globals["ok"], 5);
    }

    #[test]
    fn test_namespace_allow_mode_drops_unlisted_silently() {
        let policy = Policy::allow()
            .allow_global("x")
            .with_extra_global("factor", 2)
            .with_extra_global("secret", "s3cr3t");
        let data = input(json!({"x": 1, "y": 2}));
        let ns = AdmittedNamespace::build(&policy, Some(&data));

        assert_eq!(ns.globals["x"], 1);
        assert!(!ns.globals.contains_key("y"));
        assert!(!ns.globals.contains_key("factor"));
        assert!(!ns.globals.contains_key("secret"));
        assert!(!ns.globals.contains_key("input_data"));
    }

    #[test]
    fn test_namespace_restrict_blocked_globals() {
        let policy = Policy::restrict()
            .block_global("token")
            .with_extra_global("token", "abc")
            .with_extra_global("scale", 10);
        let data = input(json!({"token": "xyz", "n": 1}));
        let ns = AdmittedNamespace::build(&policy, Some(&data));

        assert!(!ns.globals.contains_key("token"));
        assert_eq!(ns.globals["scale"], 10);
        assert_eq!(ns.globals["n"], 1);
    }

    #[test]
    fn test_extra_globals_win_over_input() {
        let policy = Policy::restrict().with_extra_global("x", 100);
        let data = input(json!({"x": 1}));
        let ns = AdmittedNamespace::build(&policy, Some(&data));
        assert_eq!(ns.globals["x"], 100);
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("x"));
        assert!(is_identifier("_x1"));
        assert!(is_identifier("naïve"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
