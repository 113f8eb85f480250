//! Pinned package specs and content-hash environment keys.

use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static PINNED_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+==[^=\s]+$").expect("pinned package pattern is valid")
});

/// Validate and normalize pinned package specs.
///
/// Specs are trimmed, de-duplicated, and sorted so the same set always
/// produces the same hash. Any spec without an exact `==` pin is rejected.
pub fn validate_pinned_packages<S: AsRef<str>>(specs: &[S]) -> Result<Vec<String>, ConfigError> {
    let mut normalized: Vec<String> = specs
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    normalized.sort();
    normalized.dedup();

    for spec in &normalized {
        if !PINNED_PACKAGE.is_match(spec) {
            return Err(ConfigError::UnpinnedPackage(spec.clone()));
        }
    }

    Ok(normalized)
}

/// Deterministic environment hash used as an image cache key.
pub fn environment_hash(python_version: &str, namespace: Option<&str>, packages: &[String]) -> String {
    let material = format!(
        "{}|{}|{}",
        python_version,
        namespace.unwrap_or(""),
        packages.join("|")
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)[..16].to_string()
}
