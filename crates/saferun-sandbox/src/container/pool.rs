//! Warm container pool.
//!
//! One process-wide registry keyed by (daemon, image). Each slot holds at
//! most `pool_size` containers, counting ones being created or retired, so
//! concurrent dispatches never push a daemon past the cap. Callers that find
//! the slot full wait on a [`Notify`] until a lease is returned or the
//! acquire deadline passes.

use super::runtime::{ContainerRuntime, ContainerSpec};
use crate::error::SandboxError;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use once_cell::sync::Lazy;
use saferun_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

static SHARED_POOL: Lazy<Arc<ContainerPool>> = Lazy::new(|| Arc::new(ContainerPool::new()));

/// Rotation and sizing limits for one pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum concurrently running containers.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Runs served before a container is retired.
    #[serde(default = "default_max_runs")]
    pub max_runs: u32,

    /// Age after which a container is retired.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// How long to wait for a free slot.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
}

/// `min(host CPUs, 4)`.
pub fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_max_runs() -> u32 {
    25
}

fn default_ttl_seconds() -> u64 {
    600
}

fn default_acquire_timeout() -> u64 {
    7
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_runs: default_max_runs(),
            ttl_seconds: default_ttl_seconds(),
            acquire_timeout_seconds: default_acquire_timeout(),
        }
    }
}

impl PoolSettings {
    /// Defaults for a run with the given timeout.
    pub fn for_timeout(timeout_seconds: u64) -> Self {
        Self {
            acquire_timeout_seconds: timeout_seconds.max(1) + 2,
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_max_runs(mut self, runs: u32) -> Self {
        self.max_runs = runs;
        self
    }

    pub fn with_ttl_seconds(mut self, secs: u64) -> Self {
        self.ttl_seconds = secs;
        self
    }

    pub fn with_acquire_timeout_seconds(mut self, secs: u64) -> Self {
        self.acquire_timeout_seconds = secs;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    /// All limits must be positive.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.pool_size == 0 {
            errors.push("pool_size must be positive");
        }
        if self.max_runs == 0 {
            errors.push("max_runs must be positive");
        }
        if self.ttl_seconds == 0 {
            errors.push("ttl_seconds must be positive");
        }
        if self.acquire_timeout_seconds == 0 {
            errors.push("acquire_timeout_seconds must be positive");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::validation(errors.join("; ")))
        }
    }
}

/// Whether a container has served enough runs or lived long enough.
pub fn should_retire(runs: u32, age: Duration, settings: &PoolSettings) -> bool {
    runs >= settings.max_runs || age >= settings.ttl()
}

/// Lifecycle of a pooled container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Running and idle.
    Warm,
    /// Leased to a dispatch.
    InUse,
    /// Past its limits, removed on next touch.
    Expired,
    /// Gone from the daemon.
    Removed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Warm => "warm",
            Self::InUse => "in-use",
            Self::Expired => "expired",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A container checked out of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Runs served before this lease.
    pub runs: u32,
}

/// Bookkeeping view of one pooled container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PooledContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub runs: u32,
    pub state: ContainerState,
}

#[derive(Debug)]
struct PoolEntry {
    id: String,
    name: String,
    image: String,
    created_at: DateTime<Utc>,
    born: Instant,
    runs: u32,
    in_use: bool,
}

impl PoolEntry {
    fn expired(&self, settings: &PoolSettings) -> bool {
        should_retire(self.runs, self.born.elapsed(), settings)
    }

    fn lease(&self) -> Lease {
        Lease {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            runs: self.runs,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    entries: Vec<PoolEntry>,
    creating: usize,
    retiring: usize,
}

impl Slot {
    fn occupancy(&self) -> usize {
        self.entries.len() + self.creating + self.retiring
    }

    /// Pull idle expired entries out; they stay counted until removed.
    fn retire_idle(&mut self, settings: &PoolSettings) -> Vec<String> {
        let mut retired = Vec::new();
        self.entries.retain(|entry| {
            if !entry.in_use && entry.expired(settings) {
                retired.push(entry.id.clone());
                false
            } else {
                true
            }
        });
        self.retiring += retired.len();
        retired
    }

    fn checkout(&mut self) -> Option<Lease> {
        let entry = self.entries.iter_mut().find(|e| !e.in_use)?;
        entry.in_use = true;
        Some(entry.lease())
    }

    fn take(&mut self, id: &str) -> Option<PoolEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    target: String,
    image: String,
}

impl PoolKey {
    fn new(target: String, image: &str) -> Self {
        Self {
            target,
            image: image.to_string(),
        }
    }
}

enum Step {
    Reuse(Lease),
    Create,
    Wait,
}

/// Process-wide registry of warm containers.
#[derive(Debug, Default)]
pub struct ContainerPool {
    slots: Mutex<HashMap<PoolKey, Slot>>,
    notify: Notify,
}

impl ContainerPool {
    /// An empty, private pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool shared by every engine in this process.
    pub fn shared() -> Arc<Self> {
        Arc::clone(&SHARED_POOL)
    }

    /// Lease a running container for `template.image`.
    ///
    /// The lease must come back through [`release`](Self::release); until
    /// then it counts against `pool_size`.
    pub async fn acquire(
        &self,
        runtime: &dyn ContainerRuntime,
        template: &ContainerSpec,
        settings: &PoolSettings,
    ) -> Result<Lease> {
        let key = PoolKey::new(runtime.target_key(), &template.image);
        let deadline = Instant::now() + settings.acquire_timeout();

        loop {
            let notified = self.notify.notified();

            let (step, retired) = {
                let mut slots = self.slots.lock().await;
                let slot = slots.entry(key.clone()).or_default();
                let retired = slot.retire_idle(settings);

                let step = if let Some(lease) = slot.checkout() {
                    Step::Reuse(lease)
                } else if slot.occupancy() < settings.pool_size {
                    slot.creating += 1;
                    Step::Create
                } else {
                    Step::Wait
                };
                (step, retired)
            };
            self.remove_retired(runtime, &key, retired).await;

            match step {
                Step::Reuse(lease) => {
                    if runtime.is_running(&lease.id).await.unwrap_or(false) {
                        debug!(container = %lease.id, runs = lease.runs, "Reusing pool container");
                        return Ok(lease);
                    }
                    debug!(container = %lease.id, "Pool container no longer running");
                    self.discard(runtime, &key, &lease.id).await;
                }
                Step::Create => return self.create(runtime, &key, template).await,
                Step::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(SandboxError::PoolExhausted(settings.acquire_timeout_seconds));
                    }
                }
            }
        }
    }

    async fn create(&self, runtime: &dyn ContainerRuntime, key: &PoolKey, template: &ContainerSpec) -> Result<Lease> {
        let spec = template.renamed();
        let started = runtime.run_container(&spec).await;

        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.clone()).or_default();
        slot.creating = slot.creating.saturating_sub(1);

        match started {
            Ok(id) => {
                debug!(container = %id, name = %spec.name, image = %spec.image, "Pool container started");
                let entry = PoolEntry {
                    id,
                    name: spec.name,
                    image: spec.image,
                    created_at: Utc::now(),
                    born: Instant::now(),
                    runs: 0,
                    in_use: true,
                };
                let lease = entry.lease();
                slot.entries.push(entry);
                Ok(lease)
            }
            Err(e) => {
                drop(slots);
                self.notify.notify_waiters();
                Err(e)
            }
        }
    }

    /// Return a lease. Unhealthy or expired containers are removed.
    pub async fn release(&self, runtime: &dyn ContainerRuntime, lease: Lease, healthy: bool, settings: &PoolSettings) {
        let key = PoolKey::new(runtime.target_key(), &lease.image);

        let retire = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&key) {
                Some(slot) => match slot.entries.iter().position(|e| e.id == lease.id) {
                    Some(idx) => {
                        let entry = &mut slot.entries[idx];
                        entry.runs += 1;
                        entry.in_use = false;
                        if !healthy || entry.expired(settings) {
                            slot.entries.remove(idx);
                            slot.retiring += 1;
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                },
                None => false,
            }
        };

        if retire {
            self.remove_retired(runtime, &key, vec![lease.id]).await;
        } else {
            self.notify.notify_waiters();
        }
    }

    /// Drop an entry whose container misbehaved and remove it.
    async fn discard(&self, runtime: &dyn ContainerRuntime, key: &PoolKey, id: &str) {
        let found = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(key) {
                Some(slot) => {
                    if slot.take(id).is_some() {
                        slot.retiring += 1;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if found {
            self.remove_retired(runtime, key, vec![id.to_string()]).await;
        }
    }

    async fn remove_retired(&self, runtime: &dyn ContainerRuntime, key: &PoolKey, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            match runtime.remove_container(id).await {
                Ok(()) => debug!(container = %id, "Retired pool container"),
                Err(e) => warn!(container = %id, error = %e, "Failed to remove retired container"),
            }
        }

        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(key) {
            slot.retiring = slot.retiring.saturating_sub(ids.len());
        }
        drop(slots);
        self.notify.notify_waiters();
    }

    /// Bookkeeping for every container pooled against `target`.
    pub async fn snapshot(&self, target: &str, settings: &PoolSettings) -> Vec<PooledContainer> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter(|(key, _)| key.target == target)
            .flat_map(|(_, slot)| slot.entries.iter())
            .map(|entry| PooledContainer {
                id: entry.id.clone(),
                name: entry.name.clone(),
                image: entry.image.clone(),
                created_at: entry.created_at,
                runs: entry.runs,
                state: if entry.in_use {
                    ContainerState::InUse
                } else if entry.expired(settings) {
                    ContainerState::Expired
                } else {
                    ContainerState::Warm
                },
            })
            .collect()
    }

    /// Forget a container without touching the daemon.
    ///
    /// `reference` matches a full id, an id prefix, or a container name.
    pub async fn evict(&self, target: &str, reference: &str) -> bool {
        if reference.is_empty() {
            return false;
        }
        let mut slots = self.slots.lock().await;
        let mut found = false;
        for (_, slot) in slots.iter_mut().filter(|(key, _)| key.target == target) {
            let before = slot.entries.len();
            slot.entries
                .retain(|e| !(e.id.starts_with(reference) || e.name == reference));
            found |= slot.entries.len() != before;
        }
        drop(slots);
        if found {
            self.notify.notify_waiters();
        }
        found
    }

    /// Remove every container pooled against the runtime's daemon.
    pub async fn shutdown(&self, runtime: &dyn ContainerRuntime) -> usize {
        let target = runtime.target_key();
        let drained: Vec<String> = {
            let mut slots = self.slots.lock().await;
            slots
                .iter_mut()
                .filter(|(key, _)| key.target == target)
                .flat_map(|(_, slot)| slot.entries.drain(..))
                .map(|entry| entry.id)
                .collect()
        };

        let outcomes = join_all(drained.iter().map(|id| runtime.remove_container(id))).await;
        let mut removed = 0;
        for (id, outcome) in drained.iter().zip(outcomes) {
            match outcome {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to remove pool container"),
            }
        }
        self.notify.notify_waiters();
        info!(daemon = %target, removed, "Container pool shut down");
        removed
    }
}
