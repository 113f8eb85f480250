//! Resource limits for one worker run.

use saferun_core::Policy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits applied to a single worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum wall clock time in seconds.
    #[serde(default = "default_wall_time")]
    pub wall_time_secs: u64,

    /// Address-space ceiling in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Maximum bytes retained per output stream.
    #[serde(default = "default_output_size")]
    pub output_size_bytes: usize,
}

fn default_wall_time() -> u64 {
    5
}

fn default_memory_mb() -> u64 {
    256
}

fn default_output_size() -> usize {
    128 * 1024
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time_secs: default_wall_time(),
            memory_mb: default_memory_mb(),
            output_size_bytes: default_output_size(),
        }
    }
}

impl ResourceLimits {
    /// Derive limits from a validated policy.
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            wall_time_secs: policy.timeout_seconds,
            memory_mb: policy.memory_limit_mb,
            output_size_bytes: policy.max_output_bytes(),
        }
    }

    /// Builder-style method to set wall time limit.
    pub fn with_wall_time(mut self, secs: u64) -> Self {
        self.wall_time_secs = secs;
        self
    }

    /// Builder-style method to set memory limit.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Builder-style method to set the per-stream output cap.
    pub fn with_output_size(mut self, bytes: usize) -> Self {
        self.output_size_bytes = bytes;
        self
    }

    /// Wall clock deadline.
    pub fn wall_time(&self) -> Duration {
        Duration::from_secs(self.wall_time_secs)
    }

    /// Memory ceiling in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// Bytes kept from the interpreter's own stderr.
    ///
    /// Only interpreter diagnostics land there; snippet output travels
    /// inside the envelope.
    pub fn diagnostics_bytes(&self) -> usize {
        self.output_size_bytes.max(64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.wall_time_secs, 5);
        assert_eq!(limits.memory_mb, 256);
        assert_eq!(limits.output_size_bytes, 128 * 1024);
    }

    #[test]
    fn test_from_policy() {
        let policy = Policy::default()
            .with_timeout_seconds(1)
            .with_memory_limit_mb(64)
            .with_max_output_kb(4);
        let limits = ResourceLimits::from_policy(&policy);

        assert_eq!(limits.wall_time(), Duration::from_secs(1));
        assert_eq!(limits.memory_bytes(), 64 * 1024 * 1024);
        assert_eq!(limits.output_size_bytes, 4096);
        assert_eq!(limits.diagnostics_bytes(), 64 * 1024);
    }

    #[test]
    fn test_builder_methods() {
        let limits = ResourceLimits::default()
            .with_wall_time(30)
            .with_memory_mb(512)
            .with_output_size(10);
        assert_eq!(limits.wall_time_secs, 30);
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.output_size_bytes, 10);
    }
}
