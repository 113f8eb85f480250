//! `saferun cleanup` command.

use super::admin_engine;
use crate::DaemonArgs;
use console::style;

/// Remove stale managed containers and removable managed images.
pub async fn run(daemon: &DaemonArgs) -> anyhow::Result<()> {
    let engine = admin_engine(daemon)?;
    let summary = engine.cleanup_stale().await?;

    println!(
        "{} Removed {} container(s) and {} image(s)",
        style("*").green(),
        summary.removed_containers,
        summary.removed_images
    );
    Ok(())
}
