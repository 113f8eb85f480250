//! CLI command implementations.

pub mod cleanup;
pub mod inspect;
pub mod kill;
pub mod list;
pub mod run;
pub mod stop;

use crate::DaemonArgs;
use saferun_sandbox::ContainerEngine;
use tracing::debug;

/// Container engine for administrative commands against the selected daemon.
pub(crate) fn admin_engine(daemon: &DaemonArgs) -> anyhow::Result<ContainerEngine> {
    let target = daemon.target();
    debug!(daemon = %target, "Using docker daemon");
    ContainerEngine::builder()
        .with_target(target)
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid daemon options: {}", e))
}
