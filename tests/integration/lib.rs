//! Shared helpers for saferun integration tests.

use std::path::{Path, PathBuf};

/// First `python3` on `PATH`, if any.
pub fn system_python() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("python3"))
        .find(|candidate| candidate.is_file())
}

/// Lay out a minimal environment root whose interpreter is `python`.
///
/// Enough for the local engine to treat it as already provisioned.
#[cfg(unix)]
pub fn fake_env(root: &Path, python: &Path) -> std::io::Result<PathBuf> {
    let bin = root.join("bin");
    std::fs::create_dir_all(&bin)?;
    std::os::unix::fs::symlink(python, bin.join("python"))?;
    Ok(root.to_path_buf())
}
