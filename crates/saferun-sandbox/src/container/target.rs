//! Container daemon targeting.

use saferun_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Which container daemon the CLI talks to.
///
/// A named `context` and explicit `host`/SSH coordinates are mutually
/// exclusive. When both `host` and `ssh_host` are set, SSH wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
}

impl DaemonTarget {
    /// The daemon the CLI would use with no overrides.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_ssh_host(mut self, host: impl Into<String>) -> Self {
        self.ssh_host = Some(host.into());
        self
    }

    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = Some(user.into());
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    pub fn with_ssh_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_path = Some(path.into());
        self
    }

    /// Check option groups, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.is_some() && (self.host.is_some() || self.ssh_host.is_some()) {
            return Err(ConfigError::conflicting(
                "Use either a docker context or docker host/ssh settings, not both",
            ));
        }

        let mut errors = Vec::new();
        if self.ssh_host.is_none() {
            if self.ssh_user.is_some() {
                errors.push("ssh_user requires ssh_host".to_string());
            }
            if self.ssh_port.is_some() {
                errors.push("ssh_port requires ssh_host".to_string());
            }
            if self.ssh_key_path.is_some() {
                errors.push("ssh_key_path requires ssh_host".to_string());
            }
        }
        for (field, value) in [
            ("context", &self.context),
            ("host", &self.host),
            ("ssh_host", &self.ssh_host),
            ("ssh_user", &self.ssh_user),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                errors.push(format!("{} must not be empty", field));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::validation(errors.join("; ")))
        }
    }

    /// Whether any remote override is set.
    pub fn is_local(&self) -> bool {
        self.context.is_none() && self.host.is_none() && self.ssh_host.is_none()
    }

    /// Effective `DOCKER_HOST`, if overridden.
    pub fn docker_host(&self) -> Option<String> {
        if let Some(ssh_host) = &self.ssh_host {
            let user = self
                .ssh_user
                .as_deref()
                .map(|u| format!("{}@", u))
                .unwrap_or_default();
            let port = self.ssh_port.map(|p| format!(":{}", p)).unwrap_or_default();
            return Some(format!("ssh://{}{}{}", user, ssh_host, port));
        }
        self.host.clone()
    }

    /// Flags placed before the docker subcommand.
    pub fn global_args(&self) -> Vec<String> {
        match &self.context {
            Some(context) => vec!["--context".to_string(), context.clone()],
            None => Vec::new(),
        }
    }

    /// Environment overrides for the docker CLI.
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(host) = self.docker_host() {
            env.insert("DOCKER_HOST".to_string(), host);
        }
        if self.ssh_host.is_some() {
            let mut parts = vec!["ssh".to_string()];
            if let Some(port) = self.ssh_port {
                parts.push("-p".to_string());
                parts.push(port.to_string());
            }
            if let Some(key) = &self.ssh_key_path {
                parts.push("-i".to_string());
                parts.push(key.to_string_lossy().into_owned());
            }
            env.insert("DOCKER_SSH_COMMAND".to_string(), parts.join(" "));
        }
        env
    }

    /// Stable identity used to key process-wide pool and cache state.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DaemonTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            return write!(f, "context:{}", context);
        }
        match self.docker_host() {
            Some(host) => write!(f, "host:{}", host),
            None => f.write_str("local"),
        }
    }
}
