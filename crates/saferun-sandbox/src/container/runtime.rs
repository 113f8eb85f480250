//! Container runtime abstraction.

use crate::limits::ResourceLimits;
use crate::worker::WorkerRun;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saferun_core::WorkerPayload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label present on every container and image this system creates.
pub const MANAGED_LABEL: &str = "saferun.managed";

/// Value of [`MANAGED_LABEL`].
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Label naming the engine that created a resource.
pub const ENGINE_LABEL: &str = "saferun.engine";

/// Label carrying the environment hash of a resource.
pub const ENV_HASH_LABEL: &str = "saferun.env_hash";

/// Daemon-side filter selecting managed resources.
pub fn managed_filter() -> String {
    format!("label={}={}", MANAGED_LABEL, MANAGED_LABEL_VALUE)
}

/// Labels applied to every managed resource for `env_hash`.
pub fn managed_labels(env_hash: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());
    labels.insert(ENGINE_LABEL.to_string(), "docker".to_string());
    labels.insert(ENV_HASH_LABEL.to_string(), env_hash.to_string());
    labels
}

/// Whether a label set marks a resource as ours.
pub fn is_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get(MANAGED_LABEL).map(String::as_str) == Some(MANAGED_LABEL_VALUE)
}

/// tmpfs mounted over `/tmp` in every pooled container.
pub const WORKSPACE_TMPFS: &str = "/tmp:rw,noexec,nosuid,size=128m";

/// Per-run working directory inside a pooled container.
pub const WORKSPACE_DIR: &str = "/tmp/saferun";

/// Floor for the container memory limit.
const MIN_CONTAINER_MEMORY_MB: u64 = 128;

/// Everything needed to start one hardened pool container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub memory_mb: u64,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Spec with a fresh `saferun-<id>` name.
    pub fn new(image: impl Into<String>, memory_mb: u64, labels: BTreeMap<String, String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            name: format!("saferun-{}", &id[..12]),
            image: image.into(),
            memory_mb,
            labels,
        }
    }

    /// Same image and limits under a new name.
    pub fn renamed(&self) -> Self {
        Self::new(self.image.clone(), self.memory_mb, self.labels.clone())
    }

    /// `docker run` arguments after `run`.
    ///
    /// Hardening is fixed at creation and not configurable per run.
    pub fn run_args(&self) -> Vec<String> {
        let memory = format!("{}m", self.memory_mb.max(MIN_CONTAINER_MEMORY_MB));
        let mut args: Vec<String> = [
            "-d",
            "--name",
            self.name.as_str(),
            "--network",
            "none",
            "--read-only",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--pids-limit",
            "256",
            "--memory",
            memory.as_str(),
            "--tmpfs",
            WORKSPACE_TMPFS,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }
}

/// A container as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Daemon state such as `running` or `exited`.
    pub state: String,
    /// Human-readable status such as `Up 2 minutes`.
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    pub fn is_managed(&self) -> bool {
        is_managed(&self.labels)
    }
}

/// A managed image as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub created_since: String,
    pub size: String,
    pub labels: BTreeMap<String, String>,
}

impl ImageRef {
    /// `repository:tag`.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    pub fn is_managed(&self) -> bool {
        is_managed(&self.labels)
    }
}

/// Operations the pool manager needs from a container daemon.
///
/// Listing methods return only resources carrying [`MANAGED_LABEL`];
/// callers still re-check labels in-process.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Identity of the daemon this runtime talks to.
    fn target_key(&self) -> String;

    /// Fail with `DaemonUnavailable` when the CLI or daemon is unreachable.
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Build `tag` from `dockerfile` text with no build context.
    async fn build_image(&self, tag: &str, dockerfile: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Start a container and return its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn is_running(&self, id: &str) -> Result<bool>;

    /// Empty the per-run workspace.
    async fn reset_workspace(&self, id: &str) -> Result<()>;

    /// Run the worker shim inside a container.
    async fn exec_worker(&self, id: &str, payload: &WorkerPayload, limits: &ResourceLimits) -> Result<WorkerRun>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    async fn list_images(&self) -> Result<Vec<ImageRef>>;

    /// Labels of a container, or `None` if it does not exist.
    async fn container_labels(&self, id: &str) -> Result<Option<BTreeMap<String, String>>>;

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn remove_image(&self, reference: &str) -> Result<()>;
}
