//! saferun command-line interface.

pub mod commands;
pub mod render;

use clap::{Args, Parser, Subcommand};
use saferun_sandbox::DaemonTarget;
use std::path::PathBuf;
use std::process::ExitCode;

/// saferun - run untrusted Python snippets in isolation
#[derive(Parser)]
#[command(name = "saferun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(flatten)]
    pub daemon: DaemonArgs,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "saferun=info",
            1 => "saferun=debug",
            _ => "saferun=trace",
        }
    }
}

/// Docker daemon selection.
///
/// `--docker-context` excludes the host and SSH flags.
#[derive(Args, Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Docker CLI context name
    #[arg(long, env = "SAFERUN_DOCKER_CONTEXT")]
    pub docker_context: Option<String>,

    /// Docker daemon host, e.g. tcp://10.0.0.5:2376
    #[arg(long)]
    pub docker_host: Option<String>,

    /// Reach the daemon over SSH on this host
    #[arg(long)]
    pub ssh_host: Option<String>,

    /// SSH user
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// SSH port
    #[arg(long)]
    pub ssh_port: Option<u16>,

    /// SSH private key
    #[arg(long)]
    pub ssh_key_path: Option<PathBuf>,
}

impl DaemonArgs {
    /// Target described by the flags. Validated when an engine is built.
    pub fn target(&self) -> DaemonTarget {
        let mut target = DaemonTarget::local();
        if let Some(context) = &self.docker_context {
            target = target.with_context(context);
        }
        if let Some(host) = &self.docker_host {
            target = target.with_host(host);
        }
        if let Some(host) = &self.ssh_host {
            target = target.with_ssh_host(host);
        }
        if let Some(user) = &self.ssh_user {
            target = target.with_ssh_user(user);
        }
        if let Some(port) = self.ssh_port {
            target = target.with_ssh_port(port);
        }
        if let Some(key) = &self.ssh_key_path {
            target = target.with_ssh_key_path(key);
        }
        target
    }
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// List managed containers or images
    List(commands::list::ListArgs),

    /// Show one managed container
    Container(commands::inspect::InspectArgs),

    /// Stop managed containers
    Stop(commands::stop::StopArgs),

    /// Kill a managed container
    Kill(commands::kill::KillArgs),

    /// Remove stale managed containers and images
    Cleanup,

    /// Run a snippet and print the result as JSON
    Run(commands::run::RunArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments.
pub async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::List(args) => commands::list::run(args, &cli.daemon).await?,
        Commands::Container(args) => commands::inspect::run(args, &cli.daemon).await?,
        Commands::Stop(args) => commands::stop::run(args, &cli.daemon).await?,
        Commands::Kill(args) => commands::kill::run(args, &cli.daemon).await?,
        Commands::Cleanup => commands::cleanup::run(&cli.daemon).await?,
        Commands::Run(args) => return commands::run::run(args, &cli.daemon).await,
        Commands::Version => {
            println!("saferun {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(ExitCode::SUCCESS)
}
