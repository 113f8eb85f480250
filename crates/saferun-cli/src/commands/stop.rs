//! `saferun stop` commands.

use super::admin_engine;
use crate::DaemonArgs;
use clap::Args;
use console::style;

/// Stop command arguments.
#[derive(Args)]
pub struct StopArgs {
    #[command(subcommand)]
    pub command: StopCommand,
}

#[derive(clap::Subcommand)]
pub enum StopCommand {
    /// Stop one managed container
    Container {
        /// Container id or name
        id: String,

        /// Seconds to wait before killing
        #[arg(long, default_value_t = 10)]
        timeout_seconds: u64,
    },

    /// Stop every running managed container
    All {
        /// Seconds to wait before killing each container
        #[arg(long, default_value_t = 10)]
        timeout_seconds: u64,
    },
}

/// Run the stop command.
pub async fn run(args: StopArgs, daemon: &DaemonArgs) -> anyhow::Result<()> {
    let engine = admin_engine(daemon)?;

    match args.command {
        StopCommand::Container { id, timeout_seconds } => {
            engine.stop_container(&id, timeout_seconds).await?;
            println!("{} Stopped container {}", style("*").green(), id);
        }
        StopCommand::All { timeout_seconds } => {
            let stopped = engine.stop_all(timeout_seconds).await?;
            println!("{} Stopped {} container(s)", style("*").green(), stopped);
        }
    }

    Ok(())
}
