//! `saferun container` command.

use super::admin_engine;
use crate::render;
use crate::DaemonArgs;
use clap::Args;

/// Container command arguments.
#[derive(Args)]
pub struct InspectArgs {
    /// Container id, id prefix, or name
    pub reference: String,
}

/// Run the container command.
pub async fn run(args: InspectArgs, daemon: &DaemonArgs) -> anyhow::Result<()> {
    let engine = admin_engine(daemon)?;

    match engine.find_container(&args.reference).await? {
        Some(container) => render::print_container_detail(&container),
        None => anyhow::bail!("No managed container matches '{}'", args.reference),
    }

    Ok(())
}
