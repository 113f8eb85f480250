//! [`ContainerRuntime`] backed by the `docker` command-line client.

use super::runtime::{managed_filter, ContainerRuntime, ContainerSpec, ContainerSummary, ImageRef, WORKSPACE_DIR};
use super::target::DaemonTarget;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::worker::{find_on_path, ProcessWorker, WorkerCommand, WorkerRun};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saferun_core::WorkerPayload;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const CLI_MISSING: &str = "Docker CLI was not found. Install Docker and ensure it is on PATH.";
const DAEMON_DOWN: &str = "Docker is installed but the daemon is not running or not accessible";

/// Interpreter name inside runtime images.
const CONTAINER_PYTHON: &str = "python";

/// Talks to a daemon through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    target: DaemonTarget,
}

impl DockerCli {
    /// CLI for `target`, using `docker` from `PATH`.
    pub fn new(target: DaemonTarget) -> Self {
        Self {
            binary: PathBuf::from("docker"),
            target,
        }
    }

    /// Use a specific docker binary.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn target(&self) -> &DaemonTarget {
        &self.target
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.target.global_args())
            .envs(self.target.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(daemon = %self.target, ?args, "docker");
        self.command().args(args).output().await.map_err(spawn_error)
    }

    /// Run and return stdout, failing on a non-zero exit.
    async fn checked(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(command_error(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn image_labels(&self, ids: &[String]) -> Result<Vec<BTreeMap<String, String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["image", "inspect", "--format", "{{json .Config.Labels}}"];
        args.extend(ids.iter().map(String::as_str));
        let stdout = self.checked(&args).await?;
        Ok(stdout.lines().map(parse_label_json).collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn target_key(&self) -> String {
        self.target.key()
    }

    async fn ping(&self) -> Result<()> {
        let has_separator = self.binary.components().count() > 1;
        if !has_separator && find_on_path(&self.binary.to_string_lossy()).is_none() {
            return Err(SandboxError::DaemonUnavailable(CLI_MISSING.to_string()));
        }

        let output = self.output(&["info", "--format", "{{.ServerVersion}}"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::DaemonUnavailable(format!(
                "{} ({}): {}",
                DAEMON_DOWN,
                self.target,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.output(&["image", "inspect", "--format", "{{.Id}}", image]).await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.checked(&["pull", "--quiet", image]).await.map(|_| ())
    }

    async fn build_image(&self, tag: &str, dockerfile: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["build", "--tag", tag]);
        for (key, value) in labels {
            cmd.arg("--label").arg(format!("{}={}", key, value));
        }
        cmd.arg("-").stdin(Stdio::piped());

        debug!(daemon = %self.target, tag, "docker build");
        let mut child = cmd.spawn().map_err(spawn_error)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dockerfile.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(SandboxError::ImageBuild {
                tag: tag.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args = vec!["run".to_string()];
        args.extend(spec.run_args());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::ContainerStart(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let output = self
            .output(&["inspect", "--type", "container", "--format", "{{.State.Running}}", id])
            .await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn reset_workspace(&self, id: &str) -> Result<()> {
        let script = format!(
            "rm -rf /tmp/* /tmp/.[!.]* /tmp/..?* 2>/dev/null; mkdir -p {}",
            WORKSPACE_DIR
        );
        self.checked(&["exec", id, "sh", "-c", script.as_str()]).await.map(|_| ())
    }

    async fn exec_worker(&self, id: &str, payload: &WorkerPayload, limits: &ResourceLimits) -> Result<WorkerRun> {
        let mut prefix = self.target.global_args();
        prefix.extend(
            [
                "exec",
                "-i",
                "-w",
                WORKSPACE_DIR,
                "-e",
                "PYTHONIOENCODING=utf-8",
                "-e",
                "PYTHONDONTWRITEBYTECODE=1",
                id,
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        let command = WorkerCommand::wrapped(&self.binary, prefix, CONTAINER_PYTHON)
            .with_envs(std::env::vars().collect())
            .with_envs(self.target.env());
        ProcessWorker::new(command).run(payload, limits).await
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let filter = managed_filter();
        let mut args = vec!["ps", "--no-trunc", "--filter", filter.as_str(), "--format", "{{json .}}"];
        if all {
            args.insert(1, "--all");
        }
        let stdout = self.checked(&args).await?;

        let mut containers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let row: PsRow = serde_json::from_str(line)
                .map_err(|e| SandboxError::docker("ps", format!("unexpected output: {}", e)))?;
            containers.push(row.into_summary());
        }
        Ok(containers)
    }

    async fn list_images(&self) -> Result<Vec<ImageRef>> {
        let filter = managed_filter();
        let stdout = self
            .checked(&["image", "ls", "--no-trunc", "--filter", filter.as_str(), "--format", "{{json .}}"])
            .await?;

        let mut rows = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let row: ImageRow = serde_json::from_str(line)
                .map_err(|e| SandboxError::docker("image ls", format!("unexpected output: {}", e)))?;
            rows.push(row);
        }

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let labels = self.image_labels(&ids).await?;

        Ok(rows
            .into_iter()
            .zip(labels.into_iter().chain(std::iter::repeat_with(BTreeMap::new)))
            .map(|(row, labels)| ImageRef {
                id: row.id,
                repository: row.repository,
                tag: row.tag,
                created_since: row.created_since,
                size: row.size,
                labels,
            })
            .collect())
    }

    async fn container_labels(&self, id: &str) -> Result<Option<BTreeMap<String, String>>> {
        let output = self
            .output(&["inspect", "--type", "container", "--format", "{{json .Config.Labels}}", id])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(None);
            }
            return Err(command_error(&["inspect"], &output));
        }
        Ok(Some(parse_label_json(&String::from_utf8_lossy(&output.stdout))))
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        let timeout = timeout_secs.to_string();
        self.checked(&["stop", "--time", timeout.as_str(), id]).await.map(|_| ())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.checked(&["kill", id]).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.checked(&["rm", "--force", id]).await.map(|_| ())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.checked(&["image", "rm", reference]).await.map(|_| ())
    }
}

fn spawn_error(e: std::io::Error) -> SandboxError {
    if e.kind() == ErrorKind::NotFound {
        SandboxError::DaemonUnavailable(CLI_MISSING.to_string())
    } else {
        SandboxError::Io(e)
    }
}

fn command_error(args: &[&str], output: &Output) -> SandboxError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    SandboxError::docker(
        args.first().copied().unwrap_or("docker"),
        format!("{}: {}", output.status, stderr.trim()),
    )
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl PsRow {
    fn into_summary(self) -> ContainerSummary {
        ContainerSummary {
            created_at: parse_created_at(&self.created_at),
            labels: parse_label_list(&self.labels),
            id: self.id,
            name: self.names,
            image: self.image,
            state: self.state,
            status: self.status,
        }
    }
}

/// One line of `docker image ls --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct ImageRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository", default)]
    repository: String,
    #[serde(rename = "Tag", default)]
    tag: String,
    #[serde(rename = "CreatedSince", default)]
    created_since: String,
    #[serde(rename = "Size", default)]
    size: String,
}

/// Parse `k=v,k2=v2` as printed by `docker ps`.
fn parse_label_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Parse a `{{json .Config.Labels}}` object; `null` yields no labels.
fn parse_label_json(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str::<Option<BTreeMap<String, String>>>(raw.trim())
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Parse docker's `2024-01-15 10:30:00 +0000 UTC` timestamps.
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let stamp: Vec<&str> = raw.split_whitespace().take(3).collect();
    if stamp.len() < 3 {
        return None;
    }
    DateTime::parse_from_str(&stamp.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_ps_row() {
        let line = r#"{"ID":"abc123","Names":"saferun-0123456789ab","Image":"python:3.11-slim","State":"running","Status":"Up 2 minutes","CreatedAt":"2024-01-15 10:30:00 +0000 UTC","Labels":"saferun.managed=true,saferun.engine=docker,saferun.env_hash=ff"}"#;
        let row: PsRow = serde_json::from_str(line).unwrap();
        let summary = row.into_summary();

        assert_eq!(summary.id, "abc123");
        assert!(summary.is_running());
        assert!(summary.is_managed());
        assert_eq!(summary.labels["saferun.env_hash"], "ff");
        assert_eq!(summary.created_at.unwrap().year(), 2024);
    }

    #[test]
    fn test_parse_label_json() {
        let labels = parse_label_json(r#"{"saferun.managed":"true"}"#);
        assert_eq!(labels["saferun.managed"], "true");
        assert!(parse_label_json("null").is_empty());
        assert!(parse_label_json("").is_empty());
    }

    #[test]
    fn test_parse_created_at_rejects_garbage() {
        assert!(parse_created_at("yesterday").is_none());
        assert!(parse_created_at("").is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let cli = DockerCli::new(DaemonTarget::local()).with_binary("/nonexistent/docker");
        let err = cli.ping().await.unwrap_err();
        assert!(err.is_unavailable());

        let err = cli.list_containers(true).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
