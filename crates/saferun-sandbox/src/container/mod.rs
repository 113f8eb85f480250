//! Container Pool Manager.
//!
//! Runs snippets inside warm, hardened containers on a local or remote
//! docker daemon. The pool and the image cache are process-wide; every
//! container and image created here carries [`MANAGED_LABEL`], and the
//! administrative operations refuse to touch anything without it.
//!
//! An unreachable daemon fails the dispatch. There is no fallback to local
//! execution.

pub mod docker;
pub mod image;
pub mod pool;
pub mod runtime;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::DockerCli;
pub use image::{ImageCache, ImageResolver, ImageSource, DEFAULT_IMAGE, FALLBACK_IMAGE};
pub use pool::{ContainerPool, ContainerState, Lease, PoolSettings, PooledContainer};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerSummary, ImageRef, MANAGED_LABEL};
pub use target::DaemonTarget;

use crate::engine::ExecutionEngine;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::worker::WorkerRun;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use runtime::{is_managed, managed_labels};
use saferun_core::packages::{environment_hash, validate_pinned_packages};
use saferun_core::{ConfigError, ExecutionRequest, ExecutionResult, Policy, WorkerPayload};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A managed container merged with pool bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    #[serde(flatten)]
    pub summary: ContainerSummary,

    /// Runs served, when this process pooled the container.
    pub runs: Option<u32>,

    /// Pool state, when this process pooled the container.
    pub pool_state: Option<ContainerState>,
}

impl ManagedContainer {
    fn matches(&self, reference: &str) -> bool {
        !reference.is_empty()
            && (self.summary.id.starts_with(reference)
                || self.summary.name.trim_start_matches('/') == reference)
    }
}

/// Counts from [`ContainerEngine::cleanup_stale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub removed_containers: usize,
    pub removed_images: usize,
}

#[derive(Debug, Clone, Default)]
struct PoolOverrides {
    pool_size: Option<usize>,
    max_runs: Option<u32>,
    ttl_seconds: Option<u64>,
    acquire_timeout_seconds: Option<u64>,
}

impl PoolOverrides {
    fn settings(&self, timeout_seconds: u64) -> PoolSettings {
        let defaults = PoolSettings::for_timeout(timeout_seconds);
        PoolSettings {
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            max_runs: self.max_runs.unwrap_or(defaults.max_runs),
            ttl_seconds: self.ttl_seconds.unwrap_or(defaults.ttl_seconds),
            acquire_timeout_seconds: self
                .acquire_timeout_seconds
                .unwrap_or(defaults.acquire_timeout_seconds),
        }
    }
}

/// Builder for [`ContainerEngine`].
#[derive(Default)]
pub struct ContainerEngineBuilder {
    image: Option<String>,
    packages: Vec<String>,
    namespace: Option<String>,
    overrides: PoolOverrides,
    target: DaemonTarget,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    pool: Option<Arc<ContainerPool>>,
    cache: Option<Arc<ImageCache>>,
}

impl ContainerEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this image reference as-is.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Pinned `name==version` specs baked into a derived image.
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Namespace folded into the environment hash.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.overrides.pool_size = Some(size);
        self
    }

    pub fn with_max_runs(mut self, runs: u32) -> Self {
        self.overrides.max_runs = Some(runs);
        self
    }

    pub fn with_ttl_seconds(mut self, secs: u64) -> Self {
        self.overrides.ttl_seconds = Some(secs);
        self
    }

    pub fn with_acquire_timeout_seconds(mut self, secs: u64) -> Self {
        self.overrides.acquire_timeout_seconds = Some(secs);
        self
    }

    pub fn with_target(mut self, target: DaemonTarget) -> Self {
        self.target = target;
        self
    }

    /// Replace the docker CLI runtime.
    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Use a private pool instead of the process-wide one.
    pub fn with_pool(mut self, pool: Arc<ContainerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Use a private image cache instead of the process-wide one.
    pub fn with_image_cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the configuration. Nothing touches the daemon yet.
    pub fn build(self) -> std::result::Result<ContainerEngine, ConfigError> {
        self.target.validate()?;
        let packages = validate_pinned_packages(&self.packages)?;
        self.overrides.settings(Policy::default().timeout_seconds).validate()?;

        let explicit = self.image.map(|i| i.trim().to_string());
        if explicit.as_deref() == Some("") {
            return Err(ConfigError::validation("image must not be empty"));
        }

        let env_hash = environment_hash(image::PYTHON_VERSION, self.namespace.as_deref(), &packages);
        let source = match explicit {
            Some(reference) => {
                if !packages.is_empty() {
                    warn!(image = %reference, "Explicit image given; pinned packages are not installed");
                }
                ImageSource::Explicit(reference)
            }
            None if !packages.is_empty() => ImageSource::Packages {
                hash: env_hash.clone(),
                packages,
            },
            None => ImageSource::Default,
        };

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(DockerCli::new(self.target.clone())),
        };

        Ok(ContainerEngine {
            runtime,
            pool: self.pool.unwrap_or_else(ContainerPool::shared),
            cache: self.cache.unwrap_or_else(ImageCache::shared),
            source,
            env_hash,
            overrides: self.overrides,
            target: self.target,
        })
    }
}

/// Dispatches snippets into pooled containers.
pub struct ContainerEngine {
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<ContainerPool>,
    cache: Arc<ImageCache>,
    source: ImageSource,
    env_hash: String,
    overrides: PoolOverrides,
    target: DaemonTarget,
}

impl ContainerEngine {
    pub fn builder() -> ContainerEngineBuilder {
        ContainerEngineBuilder::new()
    }

    pub fn target(&self) -> &DaemonTarget {
        &self.target
    }

    pub fn env_hash(&self) -> &str {
        &self.env_hash
    }

    pub fn image_source(&self) -> &ImageSource {
        &self.source
    }

    /// Effective pool settings for a run with `timeout_seconds`.
    pub fn settings(&self, timeout_seconds: u64) -> PoolSettings {
        self.overrides.settings(timeout_seconds)
    }

    /// Resolve the runtime image, building or pulling on first use.
    pub async fn resolve_image(&self) -> Result<String> {
        ImageResolver::new(self.runtime.as_ref(), &self.cache)
            .resolve(&self.source)
            .await
    }

    /// Run one request, surfacing infrastructure failures as errors.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.runtime.ping().await?;

        let image = self.resolve_image().await?;
        let limits = ResourceLimits::from_policy(&request.policy);
        let settings = self.settings(request.policy.timeout_seconds);
        let template = ContainerSpec::new(image, limits.memory_mb, managed_labels(&self.env_hash));

        // The lease cycle runs on its own task so a caller that drops this
        // future still gets the container released.
        let leased = tokio::spawn(lease_and_run(
            Arc::clone(&self.runtime),
            Arc::clone(&self.pool),
            template,
            settings,
            request.to_payload(),
            limits.clone(),
        ));
        let run = leased
            .await
            .map_err(|e| SandboxError::Aborted(e.to_string()))??;

        Ok(run.into_result(&limits))
    }

    /// Managed containers on the daemon, running only unless `all_states`.
    pub async fn list_containers(&self, all_states: bool) -> Result<Vec<ManagedContainer>> {
        let settings = self.settings(Policy::default().timeout_seconds);
        let pooled = self.pool.snapshot(&self.runtime.target_key(), &settings).await;

        let containers = self
            .runtime
            .list_containers(all_states)
            .await?
            .into_iter()
            .filter(ContainerSummary::is_managed)
            .map(|summary| {
                let entry = pooled.iter().find(|p| p.id == summary.id);
                ManagedContainer {
                    runs: entry.map(|p| p.runs),
                    pool_state: entry.map(|p| p.state),
                    summary,
                }
            })
            .collect();
        Ok(containers)
    }

    /// Managed images on the daemon.
    pub async fn list_images(&self) -> Result<Vec<ImageRef>> {
        let images = self.runtime.list_images().await?;
        Ok(images.into_iter().filter(ImageRef::is_managed).collect())
    }

    /// Managed container by id prefix or name, in any state.
    pub async fn find_container(&self, reference: &str) -> Result<Option<ManagedContainer>> {
        let containers = self.list_containers(true).await?;
        Ok(containers.into_iter().find(|c| c.matches(reference)))
    }

    async fn ensure_managed(&self, id: &str) -> Result<()> {
        match self.runtime.container_labels(id).await? {
            Some(labels) if is_managed(&labels) => Ok(()),
            _ => Err(SandboxError::NotManaged(id.to_string())),
        }
    }

    /// Gracefully stop a managed container.
    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.ensure_managed(id).await?;
        self.runtime.stop_container(id, timeout_secs).await?;
        self.pool.evict(&self.runtime.target_key(), id).await;
        info!(container = %id, "Stopped container");
        Ok(())
    }

    /// Stop every running managed container. Returns how many stopped.
    pub async fn stop_all(&self, timeout_secs: u64) -> Result<usize> {
        let mut stopped = 0;
        for container in self.list_containers(false).await? {
            let id = &container.summary.id;
            match self.stop_container(id, timeout_secs).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to stop container"),
            }
        }
        Ok(stopped)
    }

    /// Forcefully kill a managed container.
    pub async fn kill_container(&self, id: &str) -> Result<()> {
        self.ensure_managed(id).await?;
        self.runtime.kill_container(id).await?;
        self.pool.evict(&self.runtime.target_key(), id).await;
        info!(container = %id, "Killed container");
        Ok(())
    }

    /// Remove stopped, expired, or worn-out managed containers and
    /// removable managed images.
    pub async fn cleanup_stale(&self) -> Result<CleanupSummary> {
        let settings = self.settings(Policy::default().timeout_seconds);
        let target = self.runtime.target_key();
        let now = Utc::now();
        let mut summary = CleanupSummary::default();

        for container in self.list_containers(true).await? {
            let age = container
                .summary
                .created_at
                .and_then(|created| (now - created).to_std().ok());
            let stale = !container.summary.is_running()
                || age.is_some_and(|age| age >= settings.ttl())
                || container.runs.is_some_and(|runs| runs >= settings.max_runs);
            if !stale {
                continue;
            }

            let id = &container.summary.id;
            match self.runtime.remove_container(id).await {
                Ok(()) => {
                    self.pool.evict(&target, id).await;
                    summary.removed_containers += 1;
                    debug!(container = %id, "Removed stale container");
                }
                Err(e) => warn!(container = %id, error = %e, "Failed to remove stale container"),
            }
        }

        for image in self.list_images().await? {
            let reference = image.reference();
            match self.runtime.remove_image(&reference).await {
                Ok(()) => {
                    self.cache.forget_image(&reference);
                    summary.removed_images += 1;
                    debug!(image = %reference, "Removed managed image");
                }
                Err(e) => debug!(image = %reference, error = %e, "Image still in use"),
            }
        }

        info!(
            removed_containers = summary.removed_containers,
            removed_images = summary.removed_images,
            "Cleanup finished"
        );
        Ok(summary)
    }

    /// Remove every container this process pooled on the daemon.
    pub async fn shutdown(&self) -> usize {
        self.pool.shutdown(self.runtime.as_ref()).await
    }
}

/// Acquire a container, run one payload in it, and hand it back.
async fn lease_and_run(
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<ContainerPool>,
    template: ContainerSpec,
    settings: PoolSettings,
    payload: WorkerPayload,
    limits: ResourceLimits,
) -> Result<WorkerRun> {
    let lease = pool.acquire(runtime.as_ref(), &template, &settings).await?;

    let outcome = match runtime.reset_workspace(&lease.id).await {
        Ok(()) => runtime.exec_worker(&lease.id, &payload, &limits).await,
        Err(e) => Err(e),
    };

    // A timed-out or silent worker may have left the container dirty.
    let healthy = matches!(&outcome, Ok(run) if !run.timed_out && !run.stdout.trim().is_empty());
    if !healthy {
        debug!(container = %lease.id, "Retiring container after failed run");
    }
    pool.release(runtime.as_ref(), lease, healthy, &settings).await;

    outcome
}

#[async_trait]
impl ExecutionEngine for ContainerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        match self.execute(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(daemon = %self.target, error = %e, "Container dispatch failed");
                let mut result = ExecutionResult::infrastructure(e.to_string());
                result.duration_ms = started.elapsed().as_millis() as u64;
                result.finalize(request.policy.max_output_bytes())
            }
        }
    }
}
