//! `saferun list` commands.

use super::admin_engine;
use crate::render;
use crate::DaemonArgs;
use clap::Args;

/// List command arguments.
#[derive(Args)]
pub struct ListArgs {
    #[command(subcommand)]
    pub command: ListCommand,
}

#[derive(clap::Subcommand)]
pub enum ListCommand {
    /// List managed containers
    Containers {
        /// Include stopped containers
        #[arg(long)]
        all: bool,
    },

    /// List managed images
    Images,
}

/// Run the list command.
pub async fn run(args: ListArgs, daemon: &DaemonArgs) -> anyhow::Result<()> {
    let engine = admin_engine(daemon)?;

    match args.command {
        ListCommand::Containers { all } => {
            let containers = engine.list_containers(all).await?;
            render::print_containers(&containers);
        }
        ListCommand::Images => {
            let images = engine.list_images().await?;
            render::print_images(&images);
        }
    }

    Ok(())
}
