//! Path resolution utilities.

use crate::error::ConfigError;
use std::path::PathBuf;

/// Get the saferun base directory (~/.saferun).
pub fn base_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ConfigError::Validation("Could not determine home directory".to_string())
    })?;
    Ok(home.join(".saferun"))
}

/// Get the default local environment directory (~/.saferun/env).
pub fn default_env_dir() -> Result<PathBuf, ConfigError> {
    Ok(base_dir()?.join("env"))
}

/// Get the default policy file path (~/.saferun/policy.toml).
pub fn default_policy_file() -> Result<PathBuf, ConfigError> {
    Ok(base_dir()?.join("policy.toml"))
}

/// Expand tilde (~) in a path.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_dir() {
        let dir = base_dir().unwrap();
        assert!(dir.ends_with(".saferun"));
    }

    #[test]
    fn test_default_paths() {
        assert!(default_env_dir().unwrap().ends_with(".saferun/env"));
        assert!(default_policy_file().unwrap().ends_with("policy.toml"));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/test");
        assert!(!expanded.to_string_lossy().contains('~'));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
