//! Sandbox error types.

use saferun_core::ConfigError;
use std::io;
use thiserror::Error;

/// Errors that can occur during sandbox operations.
///
/// Dispatch paths fold these into a failed `ExecutionResult`; administrative
/// operations return them directly.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid engine or policy configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker process could not be started.
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Local environment creation failed.
    #[error("Environment setup failed: {0}")]
    EnvironmentSetup(String),

    /// Package installation failed.
    #[error("Failed to install packages: {0}")]
    PackageInstall(String),

    /// Container CLI or daemon is not reachable.
    #[error("{0}")]
    DaemonUnavailable(String),

    /// Image could be neither found nor pulled.
    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    /// Image build failed.
    #[error("Failed to build image {tag}: {message}")]
    ImageBuild { tag: String, message: String },

    /// Pool container could not be started.
    #[error("Failed to start container: {0}")]
    ContainerStart(String),

    /// No pool slot became free in time.
    #[error("Timed out acquiring container from pool after {0}s")]
    PoolExhausted(u64),

    /// Target is not a managed resource.
    #[error("Container '{0}' is not managed by saferun and cannot be modified")]
    NotManaged(String),

    /// Container CLI returned an error.
    #[error("docker {command} failed: {message}")]
    Docker { command: String, message: String },

    /// The task running a container dispatch panicked or was cancelled.
    #[error("Container dispatch aborted: {0}")]
    Aborted(String),

    /// Worker output could not be decoded.
    #[error("Worker protocol error: {0}")]
    Protocol(String),
}

impl SandboxError {
    /// Create a docker CLI error.
    pub fn docker(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Docker {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an environment setup error.
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::EnvironmentSetup(msg.into())
    }

    /// Whether this error means the target daemon could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::DaemonUnavailable(_))
    }
}
