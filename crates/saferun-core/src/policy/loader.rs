//! Policy loading from TOML files.

use super::Policy;
use crate::error::ConfigError;
use std::fs;
use std::path::Path;
use tracing::debug;

impl Policy {
    /// Load a policy from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        debug!(path = %path.display(), "Loading policy file");
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a policy from TOML text.
    ///
    /// Accepts either a bare table or one nested under `[policy]`.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table =
            content.parse().map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;

        let body = match table.remove("policy") {
            Some(toml::Value::Table(inner)) if table.is_empty() => inner,
            Some(toml::Value::Table(_)) => {
                return Err(ConfigError::Parse(
                    "policy keys must be either top-level or under [policy], not both".to_string(),
                ))
            }
            Some(_) => {
                return Err(ConfigError::Parse("'policy' must be a TOML table".to_string()))
            }
            None => table,
        };

        toml::Value::Table(body)
            .try_into::<Policy>()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save the policy to a file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml_string()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }
}
