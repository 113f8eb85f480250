//! `saferun run` command.

use crate::DaemonArgs;
use anyhow::Context;
use clap::{Args, ValueEnum};
use saferun_core::paths;
use saferun_sandbox::{ContainerEngine, EnvCreator, LocalEngine, RunOptions};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

/// Which engine executes the snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Virtual environment on this host
    Local,
    /// Pooled docker container
    Docker,
}

/// Run command arguments.
#[derive(Args)]
pub struct RunArgs {
    /// Snippet file, or '-' to read stdin
    pub file: String,

    /// Execution engine
    #[arg(long, value_enum, default_value_t = EngineKind::Local)]
    pub engine: EngineKind,

    /// Local environment root (default: ~/.saferun/env)
    #[arg(long)]
    pub env_dir: Option<PathBuf>,

    /// Local environment creator: uv or venv
    #[arg(long, default_value = "uv")]
    pub creator: EnvCreator,

    /// Pinned package spec (name==version), repeatable
    #[arg(long = "package")]
    pub packages: Vec<String>,

    /// Docker image to use as-is
    #[arg(long)]
    pub image: Option<String>,

    /// Input variables as a JSON object
    #[arg(long)]
    pub input: Option<String>,

    /// Policy TOML file (default: ~/.saferun/policy.toml when present)
    #[arg(long)]
    pub policy_file: Option<PathBuf>,
}

impl RunArgs {
    fn read_code(&self) -> anyhow::Result<String> {
        if self.file == "-" {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read snippet from stdin")?;
            return Ok(code);
        }
        std::fs::read_to_string(&self.file).with_context(|| format!("Failed to read {}", self.file))
    }

    fn options(&self) -> anyhow::Result<RunOptions> {
        let mut options = RunOptions::new();

        if let Some(raw) = &self.input {
            options = options.with_input(parse_input(raw)?);
        }

        match &self.policy_file {
            Some(path) => options = options.with_policy_file(path),
            None => {
                let default = paths::default_policy_file()?;
                if default.exists() {
                    options = options.with_policy_file(default);
                }
            }
        }

        Ok(options)
    }
}

/// Parse `--input` as a JSON object.
pub fn parse_input(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--input must be a JSON object"),
    }
}

/// Run the run command. Exits non-zero unless the snippet succeeded.
pub async fn run(args: RunArgs, daemon: &DaemonArgs) -> anyhow::Result<ExitCode> {
    let code = args.read_code()?;
    let options = args.options()?;

    let result = match args.engine {
        EngineKind::Local => {
            let env_dir = match &args.env_dir {
                Some(dir) => dir.clone(),
                None => paths::default_env_dir()?,
            };
            let engine = LocalEngine::builder(env_dir)
                .with_creator(args.creator)
                .with_packages(args.packages.iter().cloned())
                .build()?;
            saferun_sandbox::run(&code, &engine, options).await?
        }
        EngineKind::Docker => {
            let mut builder = ContainerEngine::builder()
                .with_target(daemon.target())
                .with_packages(args.packages.iter().cloned());
            if let Some(image) = &args.image {
                builder = builder.with_image(image);
            }
            let engine = builder.build()?;
            let result = saferun_sandbox::run(&code, &engine, options).await;
            engine.shutdown().await;
            result?
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
