//! Runtime image resolution and the process-wide image cache.

use super::runtime::{managed_labels, ContainerRuntime};
use crate::error::SandboxError;
use crate::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use saferun_core::packages::environment_hash;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Published runtime image pulled when nothing more specific is requested.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Locally built runtime image used when the default cannot be pulled.
pub const FALLBACK_IMAGE: &str = "saferun-runtime:local";

/// Repository for package-specific images, tagged by environment hash.
pub const PACKAGE_IMAGE_REPOSITORY: &str = "saferun-env";

/// Interpreter version baked into every runtime image.
pub const PYTHON_VERSION: &str = "3.11";

/// Build recipe for [`FALLBACK_IMAGE`].
pub const RUNTIME_DOCKERFILE: &str = include_str!("../../docker/runtime.Dockerfile");

static SHARED_CACHE: Lazy<Arc<ImageCache>> = Lazy::new(|| Arc::new(ImageCache::new()));

/// Where a container engine's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Caller-supplied reference, used as-is.
    Explicit(String),
    /// Pinned packages layered over the base runtime.
    Packages { hash: String, packages: Vec<String> },
    /// The default runtime, or the local fallback.
    Default,
}

impl ImageSource {
    fn cache_key(&self) -> String {
        match self {
            Self::Explicit(reference) => format!("explicit:{}", reference),
            Self::Packages { hash, .. } => format!("packages:{}", hash),
            Self::Default => "default".to_string(),
        }
    }
}

/// One cached resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCacheEntry {
    pub key: String,
    pub image: String,
    pub resolved_at: DateTime<Utc>,
}

/// Resolved image references, keyed by daemon and source.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: RwLock<HashMap<String, ImageCacheEntry>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every engine in this process.
    pub fn shared() -> Arc<Self> {
        Arc::clone(&SHARED_CACHE)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|e| e.image.clone())
    }

    pub fn insert(&self, key: impl Into<String>, image: impl Into<String>) {
        let key = key.into();
        let entry = ImageCacheEntry {
            key: key.clone(),
            image: image.into(),
            resolved_at: Utc::now(),
        };
        self.entries.write().insert(key, entry);
    }

    /// Drop every entry resolving to `reference`. Returns how many were dropped.
    pub fn forget_image(&self, reference: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.image != reference);
        before - entries.len()
    }

    pub fn entries(&self) -> Vec<ImageCacheEntry> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Per-key lock serializing resolution of one source.
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// Dockerfile layering pinned packages over `base`.
///
/// Uses exec form so package specs never pass through a shell.
pub fn package_dockerfile(base: &str, packages: &[String]) -> String {
    let mut argv: Vec<&str> = vec!["python", "-m", "pip", "install", "--no-cache-dir"];
    argv.extend(packages.iter().map(String::as_str));
    let run = serde_json::to_string(&argv).unwrap_or_default();
    format!("FROM {}\nENV PYTHONDONTWRITEBYTECODE=1\nRUN {}\n", base, run)
}

/// Resolves an [`ImageSource`] to a reference present on the daemon.
pub struct ImageResolver<'a> {
    runtime: &'a dyn ContainerRuntime,
    cache: &'a ImageCache,
}

impl<'a> ImageResolver<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, cache: &'a ImageCache) -> Self {
        Self { runtime, cache }
    }

    /// Resolve `source`, building or pulling at most once per daemon and source.
    pub async fn resolve(&self, source: &ImageSource) -> Result<String> {
        let key = format!("{}|{}", self.runtime.target_key(), source.cache_key());
        if let Some(image) = self.cache.get(&key) {
            debug!(image = %image, "Image cache hit");
            return Ok(image);
        }

        let lock = self.cache.lock_for(&key);
        let _guard = lock.lock().await;
        if let Some(image) = self.cache.get(&key) {
            debug!(image = %image, "Image resolved by concurrent request");
            return Ok(image);
        }

        let image = match source {
            ImageSource::Explicit(reference) => {
                if !self.ensure_available(reference).await? {
                    return Err(SandboxError::ImageUnavailable(reference.clone()));
                }
                reference.clone()
            }
            ImageSource::Packages { hash, packages } => self.package_image(hash, packages).await?,
            ImageSource::Default => self.base_image().await?,
        };

        self.cache.insert(key, image.clone());
        Ok(image)
    }

    /// Present locally, or pulled. Daemon outages still propagate.
    async fn ensure_available(&self, image: &str) -> Result<bool> {
        if self.runtime.image_exists(image).await? {
            return Ok(true);
        }
        info!(image = %image, "Pulling image");
        match self.runtime.pull_image(image).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_unavailable() => Err(e),
            Err(e) => {
                warn!(image = %image, error = %e, "Image pull failed");
                Ok(false)
            }
        }
    }

    async fn base_image(&self) -> Result<String> {
        if self.ensure_available(DEFAULT_IMAGE).await? {
            return Ok(DEFAULT_IMAGE.to_string());
        }
        if self.runtime.image_exists(FALLBACK_IMAGE).await? {
            return Ok(FALLBACK_IMAGE.to_string());
        }

        info!(image = FALLBACK_IMAGE, "Building local runtime image");
        let labels = managed_labels(&environment_hash(PYTHON_VERSION, None, &[]));
        self.runtime
            .build_image(FALLBACK_IMAGE, RUNTIME_DOCKERFILE, &labels)
            .await?;
        Ok(FALLBACK_IMAGE.to_string())
    }

    async fn package_image(&self, hash: &str, packages: &[String]) -> Result<String> {
        let tag = format!("{}:{}", PACKAGE_IMAGE_REPOSITORY, hash);
        if self.runtime.image_exists(&tag).await? {
            debug!(image = %tag, "Reusing package image");
            return Ok(tag);
        }

        let base = self.base_image().await?;
        info!(image = %tag, base = %base, packages = packages.len(), "Building package image");
        self.runtime
            .build_image(&tag, &package_dockerfile(&base, packages), &managed_labels(hash))
            .await?;
        Ok(tag)
    }
}
