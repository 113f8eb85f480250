//! In-memory container runtime for tests.

use super::runtime::{is_managed, ContainerRuntime, ContainerSpec, ContainerSummary, ImageRef};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::worker::WorkerRun;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use saferun_core::WorkerPayload;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, ContainerSummary>,
    images: BTreeMap<String, BTreeMap<String, String>>,
    pulls: Vec<String>,
    builds: Vec<String>,
    removed_images: Vec<String>,
    stopped: Vec<String>,
    killed: Vec<String>,
    removed: Vec<String>,
    resets: usize,
    started: usize,
    peak_running: usize,
    next_id: u64,
    last_payload: Option<WorkerPayload>,
}

impl FakeState {
    fn running(&self) -> usize {
        self.containers.values().filter(|c| c.is_running()).count()
    }
}

/// Records every call and keeps containers and images in memory.
#[derive(Debug)]
pub(crate) struct FakeRuntime {
    key: String,
    unavailable: bool,
    pull_fails: bool,
    exec_delay: Duration,
    exec_outcome: Mutex<Option<WorkerRun>>,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            key: "local".to_string(),
            unavailable: false,
            pull_fails: false,
            exec_delay: Duration::ZERO,
            exec_outcome: Mutex::new(None),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn with_failing_pulls(mut self) -> Self {
        self.pull_fails = true;
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Replace the default successful exec outcome.
    pub fn set_exec_outcome(&self, run: WorkerRun) {
        *self.exec_outcome.lock() = Some(run);
    }

    pub fn add_image(&self, reference: &str, labels: BTreeMap<String, String>) {
        self.state.lock().images.insert(reference.to_string(), labels);
    }

    /// Insert a container the pool never created.
    pub fn add_container(&self, id: &str, state: &str, labels: BTreeMap<String, String>) {
        self.state.lock().containers.insert(
            id.to_string(),
            ContainerSummary {
                id: id.to_string(),
                name: format!("external-{}", id),
                image: "busybox:latest".to_string(),
                state: state.to_string(),
                status: String::new(),
                created_at: Some(Utc::now()),
                labels,
            },
        );
    }

    pub fn stop_externally(&self, id: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.state = "exited".to_string();
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state.lock().containers.contains_key(id)
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.state.lock().containers.get(id).map(|c| c.state.clone())
    }

    pub fn running(&self) -> usize {
        self.state.lock().running()
    }

    pub fn started(&self) -> usize {
        self.state.lock().started
    }

    pub fn peak_running(&self) -> usize {
        self.state.lock().peak_running
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    pub fn builds(&self) -> Vec<String> {
        self.state.lock().builds.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().removed_images.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }

    pub fn last_payload(&self) -> Option<WorkerPayload> {
        self.state.lock().last_payload.clone()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable {
            Err(SandboxError::DaemonUnavailable("Docker daemon is not reachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn missing(id: &str) -> SandboxError {
        SandboxError::docker("docker", format!("No such container: {}", id))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn target_key(&self) -> String {
        self.key.clone()
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.check()?;
        Ok(self.state.lock().images.contains_key(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.pulls.push(image.to_string());
        if self.pull_fails {
            return Err(SandboxError::ImageUnavailable(format!("pull access denied for {}", image)));
        }
        state.images.insert(image.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn build_image(&self, tag: &str, _dockerfile: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.check()?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut state = self.state.lock();
        state.builds.push(tag.to_string());
        state.images.insert(tag.to_string(), labels.clone());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check()?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.insert(
            id.clone(),
            ContainerSummary {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "running".to_string(),
                status: "Up 1 second".to_string(),
                created_at: Some(Utc::now()),
                labels: spec.labels.clone(),
            },
        );
        state.started += 1;
        state.peak_running = state.peak_running.max(state.running());
        Ok(id)
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.state.lock().containers.get(id).is_some_and(|c| c.is_running()))
    }

    async fn reset_workspace(&self, id: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.containers.contains_key(id) {
            return Err(Self::missing(id));
        }
        state.resets += 1;
        Ok(())
    }

    async fn exec_worker(&self, id: &str, payload: &WorkerPayload, _limits: &ResourceLimits) -> Result<WorkerRun> {
        self.check()?;
        if !self.state.lock().containers.contains_key(id) {
            return Err(Self::missing(id));
        }
        tokio::time::sleep(self.exec_delay).await;
        self.state.lock().last_payload = Some(payload.clone());

        if let Some(run) = self.exec_outcome.lock().clone() {
            return Ok(run);
        }
        Ok(WorkerRun {
            exit_code: Some(0),
            stdout: r#"{"ok":true,"result":42,"stdout":"hi\n","stderr":""}"#.to_string(),
            ..Default::default()
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| c.is_managed())
            .filter(|c| all || c.is_running())
            .cloned()
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageRef>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .images
            .iter()
            .filter(|(_, labels)| is_managed(labels))
            .map(|(reference, labels)| {
                let (repository, tag) = reference.rsplit_once(':').unwrap_or((reference.as_str(), "latest"));
                ImageRef {
                    id: format!("sha256:{}", repository.len()),
                    repository: repository.to_string(),
                    tag: tag.to_string(),
                    created_since: "1 minute ago".to_string(),
                    size: "120MB".to_string(),
                    labels: labels.clone(),
                }
            })
            .collect())
    }

    async fn container_labels(&self, id: &str) -> Result<Option<BTreeMap<String, String>>> {
        self.check()?;
        let state = self.state.lock();
        let found = state
            .containers
            .values()
            .find(|c| c.id == id || c.id.starts_with(id) || c.name == id);
        Ok(found.map(|c| c.labels.clone()))
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.state = "exited".to_string();
        state.stopped.push(id.to_string());
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.state = "exited".to_string();
        state.killed.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.containers.remove(id).ok_or_else(|| Self::missing(id))?;
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.images.remove(reference);
        state.removed_images.push(reference.to_string());
        Ok(())
    }
}
