//! Local Engine.
//!
//! Owns one reusable virtual environment on disk and runs every request in
//! a fresh worker process rooted at that environment's interpreter.

use crate::engine::ExecutionEngine;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::worker::{find_on_path, ProcessWorker, WorkerCommand};
use crate::Result;
use async_trait::async_trait;
use saferun_core::packages::validate_pinned_packages;
use saferun_core::paths::expand_tilde;
use saferun_core::{ConfigError, ExecutionRequest, ExecutionResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// File recording the package set installed into an environment.
pub const PACKAGE_MARKER: &str = ".saferun-packages.txt";

/// Tool used to create the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvCreator {
    /// `uv venv`, falling back to `venv` when uv is missing or fails.
    #[default]
    Uv,

    /// `python -m venv`.
    Venv,
}

impl std::str::FromStr for EnvCreator {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uv" => Ok(Self::Uv),
            "venv" | "python" => Ok(Self::Venv),
            other => Err(ConfigError::validation(format!(
                "environment creator must be 'uv' or 'venv', got '{}'",
                other
            ))),
        }
    }
}

/// Builder for [`LocalEngine`].
#[derive(Debug, Clone)]
pub struct LocalEngineBuilder {
    env_dir: PathBuf,
    creator: EnvCreator,
    packages: Vec<String>,
    base_python: Option<PathBuf>,
}

impl LocalEngineBuilder {
    /// Start a builder for the environment rooted at `env_dir`.
    ///
    /// `env_dir` is the environment itself, not a parent directory.
    pub fn new(env_dir: impl Into<PathBuf>) -> Self {
        Self {
            env_dir: env_dir.into(),
            creator: EnvCreator::default(),
            packages: Vec::new(),
            base_python: None,
        }
    }

    /// Choose the environment creator.
    pub fn with_creator(mut self, creator: EnvCreator) -> Self {
        self.creator = creator;
        self
    }

    /// Pinned packages to install on first use.
    pub fn with_packages<S: Into<String>>(mut self, packages: impl IntoIterator<Item = S>) -> Self {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Interpreter used to create the environment (default `python3`).
    pub fn with_base_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.base_python = Some(python.into());
        self
    }

    /// Validate the configuration. Nothing touches the disk yet.
    pub fn build(self) -> std::result::Result<LocalEngine, ConfigError> {
        let raw = self.env_dir.to_string_lossy();
        if raw.trim().is_empty() {
            return Err(ConfigError::validation(
                "LocalEngine requires a non-empty environment directory",
            ));
        }
        let env_dir = expand_tilde(raw.trim());
        let packages = validate_pinned_packages(&self.packages)?;

        Ok(LocalEngine {
            env_dir,
            creator: self.creator,
            packages,
            base_python: self.base_python,
            provisioned: OnceCell::new(),
        })
    }
}

/// Runs snippets in a managed local virtual environment.
#[derive(Debug)]
pub struct LocalEngine {
    env_dir: PathBuf,
    creator: EnvCreator,
    packages: Vec<String>,
    base_python: Option<PathBuf>,
    provisioned: OnceCell<PathBuf>,
}

impl LocalEngine {
    /// Start building an engine for `env_dir`.
    pub fn builder(env_dir: impl Into<PathBuf>) -> LocalEngineBuilder {
        LocalEngineBuilder::new(env_dir)
    }

    /// Environment root.
    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    /// Normalized pinned packages.
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Interpreter inside the environment.
    pub fn interpreter(&self) -> PathBuf {
        interpreter_path(&self.env_dir)
    }

    /// Create the environment and install packages if needed.
    ///
    /// Runs at most once per engine; concurrent callers wait for the first.
    /// A failed attempt is retried on the next call.
    pub async fn prepare(&self) -> Result<&Path> {
        let path = self
            .provisioned
            .get_or_try_init(|| async { self.provision().await })
            .await?;
        Ok(path.as_path())
    }

    async fn provision(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.env_dir).await?;
        let interpreter = self.interpreter();

        if interpreter.exists() {
            debug!(env = %self.env_dir.display(), "Reusing existing environment");
        } else {
            self.create_environment().await?;
            if !interpreter.exists() {
                return Err(SandboxError::environment(format!(
                    "environment created but {} is missing",
                    interpreter.display()
                )));
            }
        }

        if !self.packages.is_empty() {
            self.install_packages(&interpreter).await?;
        }

        Ok(interpreter)
    }

    fn base_python(&self) -> PathBuf {
        self.base_python.clone().unwrap_or_else(|| PathBuf::from("python3"))
    }

    async fn create_environment(&self) -> Result<()> {
        if self.creator == EnvCreator::Uv {
            match self.create_with_uv().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "uv unavailable, falling back to python -m venv"),
            }
        }
        self.create_with_venv().await
    }

    async fn create_with_uv(&self) -> Result<()> {
        let uv = find_on_path("uv").ok_or_else(|| SandboxError::environment("uv not found on PATH"))?;
        let mut args = vec!["venv".to_string(), self.env_dir.to_string_lossy().into_owned()];
        if let Some(python) = &self.base_python {
            args.push("--python".to_string());
            args.push(python.to_string_lossy().into_owned());
        }

        info!(env = %self.env_dir.display(), "Creating environment with uv");
        let output = run_tool(&uv, &args).await?;
        check_output(&output, "uv venv").map_err(SandboxError::EnvironmentSetup)
    }

    async fn create_with_venv(&self) -> Result<()> {
        let python = self.base_python();
        let args = vec![
            "-m".to_string(),
            "venv".to_string(),
            self.env_dir.to_string_lossy().into_owned(),
        ];

        info!(env = %self.env_dir.display(), python = %python.display(), "Creating environment with venv");
        let output = run_tool(&python, &args).await?;
        check_output(&output, "python -m venv").map_err(SandboxError::EnvironmentSetup)
    }

    async fn install_packages(&self, interpreter: &Path) -> Result<()> {
        let marker = self.env_dir.join(PACKAGE_MARKER);
        let desired = format!("{}\n", self.packages.join("\n"));

        if let Ok(current) = tokio::fs::read_to_string(&marker).await {
            if current == desired {
                debug!(env = %self.env_dir.display(), "Packages already installed");
                return Ok(());
            }
        }

        info!(env = %self.env_dir.display(), packages = ?self.packages, "Installing packages");
        let interpreter_arg = interpreter.to_string_lossy().into_owned();
        let uv = find_on_path("uv").filter(|_| created_by_uv(&self.env_dir));

        let output = match uv {
            Some(uv) => {
                let mut args = vec![
                    "pip".to_string(),
                    "install".to_string(),
                    "--python".to_string(),
                    interpreter_arg,
                ];
                args.extend(self.packages.iter().cloned());
                run_tool(&uv, &args).await?
            }
            None => {
                let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
                args.extend(self.packages.iter().cloned());
                run_tool(interpreter, &args).await?
            }
        };
        check_output(&output, "pip install").map_err(SandboxError::PackageInstall)?;

        tokio::fs::write(&marker, desired).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> ExecutionResult {
        let limits = ResourceLimits::from_policy(&request.policy);

        let interpreter = match self.prepare().await {
            Ok(path) => path.to_path_buf(),
            Err(e) => {
                warn!(env = %self.env_dir.display(), error = %e, "Local environment unavailable");
                return ExecutionResult::infrastructure(e.to_string())
                    .finalize(limits.output_size_bytes);
            }
        };

        let command = WorkerCommand::python(interpreter).with_working_dir(&self.env_dir);
        ProcessWorker::new(command)
            .execute(&request.to_payload(), &limits)
            .await
    }
}

/// Interpreter location inside an environment root.
pub fn interpreter_path(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

/// uv records itself in `pyvenv.cfg`; such environments ship without pip.
fn created_by_uv(env_dir: &Path) -> bool {
    std::fs::read_to_string(env_dir.join("pyvenv.cfg"))
        .map(|cfg| cfg.lines().any(|line| line.trim_start().starts_with("uv ")))
        .unwrap_or(false)
}

async fn run_tool(program: &Path, args: &[String]) -> Result<Output> {
    debug!(program = %program.display(), ?args, "Running tool");
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SandboxError::SpawnFailed(format!("{}: {}", program.display(), e)))
}

fn check_output(output: &Output, what: &str) -> std::result::Result<(), String> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!("{} failed ({}): {}", what, output.status, stderr.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use saferun_core::Policy;
    use serde_json::json;
    use tempfile::TempDir;

    /// An environment whose interpreter is a link to the host python3.
    fn linked_env(dir: &Path) -> Option<()> {
        let python = find_on_path("python3")?;
        let bin = interpreter_path(dir);
        std::fs::create_dir_all(bin.parent()?).ok()?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(python, &bin).ok()?;
        #[cfg(not(unix))]
        return None;
        Some(())
    }

    #[test]
    fn test_builder_rejects_empty_path() {
        let err = LocalEngine::builder("  ").build().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_builder_rejects_unpinned_package() {
        let err = LocalEngine::builder("/tmp/env")
            .with_packages(["pandas"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnpinnedPackage(ref p) if p == "pandas"));
    }

    #[test]
    fn test_builder_normalizes_packages() {
        let engine = LocalEngine::builder("/tmp/env")
            .with_packages(["tzdata==2024.1", "packaging==24.1", "tzdata==2024.1"])
            .with_creator(EnvCreator::Venv)
            .build()
            .unwrap();
        assert_eq!(engine.packages(), ["packaging==24.1", "tzdata==2024.1"]);
        assert_eq!(engine.name(), "local");
    }

    #[test]
    fn test_interpreter_path() {
        let path = interpreter_path(Path::new("/envs/a"));
        if cfg!(windows) {
            assert!(path.ends_with("Scripts/python.exe"));
        } else {
            assert_eq!(path, PathBuf::from("/envs/a/bin/python"));
        }
    }

    #[test]
    fn test_creator_from_str() {
        assert_eq!("uv".parse::<EnvCreator>().unwrap(), EnvCreator::Uv);
        assert_eq!("venv".parse::<EnvCreator>().unwrap(), EnvCreator::Venv);
        assert!("conda".parse::<EnvCreator>().is_err());
    }

    #[test]
    fn test_created_by_uv_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyvenv.cfg"), "home = /usr/bin\nuv = 0.4.0\n").unwrap();
        assert!(created_by_uv(dir.path()));

        std::fs::write(dir.path().join("pyvenv.cfg"), "home = /usr/bin\nversion = 3.11.4\n").unwrap();
        assert!(!created_by_uv(dir.path()));
    }

    #[tokio::test]
    async fn test_matching_marker_skips_install() {
        let dir = TempDir::new().unwrap();
        if linked_env(dir.path()).is_none() {
            return;
        }
        std::fs::write(dir.path().join(PACKAGE_MARKER), "nonexistent-pkg==0.0.1\n").unwrap();

        let engine = LocalEngine::builder(dir.path())
            .with_packages(["nonexistent-pkg==0.0.1"])
            .build()
            .unwrap();
        let interpreter = engine.prepare().await.unwrap();
        assert_eq!(interpreter, engine.interpreter());
    }

    #[tokio::test]
    async fn test_dispatch_in_existing_env() {
        let dir = TempDir::new().unwrap();
        if linked_env(dir.path()).is_none() {
            return;
        }
        let engine = LocalEngine::builder(dir.path()).build().unwrap();
        let request = ExecutionRequest::new("result = x * 2", Policy::default())
            .with_input(json!({"x": 21}).as_object().cloned().unwrap());

        let (a, b) = tokio::join!(engine.dispatch(&request), engine.dispatch(&request));
        assert!(a.ok, "{:?}", a.error);
        assert_eq!(a.result, Some(json!(42)));
        assert_eq!(b.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_provision_failure_is_folded() {
        let dir = TempDir::new().unwrap();
        let engine = LocalEngine::builder(dir.path().join("env"))
            .with_creator(EnvCreator::Venv)
            .with_base_python("/nonexistent/python3")
            .build()
            .unwrap();

        let result = engine
            .dispatch(&ExecutionRequest::new("result = 1", Policy::default()))
            .await;
        assert!(!result.ok);
        assert!(result.exit_code.is_none());
        assert!(result.error.is_some());
        assert!(engine.prepare().await.is_err());
    }
}
