//! `saferun kill` command.

use super::admin_engine;
use crate::DaemonArgs;
use clap::Args;
use console::style;

/// Kill command arguments.
#[derive(Args)]
pub struct KillArgs {
    #[command(subcommand)]
    pub command: KillCommand,
}

#[derive(clap::Subcommand)]
pub enum KillCommand {
    /// Kill one managed container
    Container {
        /// Container id or name
        id: String,
    },
}

/// Run the kill command.
pub async fn run(args: KillArgs, daemon: &DaemonArgs) -> anyhow::Result<()> {
    let engine = admin_engine(daemon)?;

    match args.command {
        KillCommand::Container { id } => {
            engine.kill_container(&id).await?;
            println!("{} Killed container {}", style("*").green(), id);
        }
    }

    Ok(())
}
