//! Platform-specific paths.
//!
//! All `#[cfg]` decisions about where things live on disk are made here:
//! - the runtime directory holding instance locks and relay sockets
//! - the release script next to the front-end executable

use crate::config::{RelayConfig, ReleaseLayout};
use crate::error::{ElixirKitError, Result};
use std::path::{Path, PathBuf};

/// Get the default runtime directory for locks and relay sockets.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR/elixirkit`, falling back to the temp dir
/// - **Windows/macOS**: `{temp}/elixirkit`
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(RelayConfig::RUNTIME_DIR_NAME)
}

/// Directory of the currently running executable.
pub fn current_exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ElixirKitError::ReleaseNotFound(exe.clone()))
}

/// Get the path to a release start script.
///
/// # Platform Behavior
/// - **Linux/macOS**: `{app_dir}/rel/bin/{name}`
/// - **Windows**: `{app_dir}/rel/bin/{name}.bat`
pub fn release_script(app_dir: &Path, name: &str) -> PathBuf {
    let bin = app_dir
        .join(ReleaseLayout::REL_DIR_NAME)
        .join(ReleaseLayout::BIN_DIR_NAME);

    if cfg!(windows) {
        bin.join(format!(
            "{}.{}",
            name,
            ReleaseLayout::WINDOWS_SCRIPT_EXTENSION
        ))
    } else {
        bin.join(name)
    }
}
