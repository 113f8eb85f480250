//! Error types for saferun core.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors.
///
/// These indicate a caller bug and are raised before any process or
/// container is started. They are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflicting options: {0}")]
    ConflictingOptions(String),

    #[error("Package specs must be pinned as 'name==version'. Invalid package: {0}")]
    UnpinnedPackage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflicting-options error.
    pub fn conflicting(msg: impl Into<String>) -> Self {
        Self::ConflictingOptions(msg.into())
    }
}
