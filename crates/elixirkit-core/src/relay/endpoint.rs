//! Relay endpoint naming.

use crate::arbiter::AppId;
use std::fmt;
use std::path::Path;

#[cfg(unix)]
use crate::config::RelayConfig;
#[cfg(unix)]
use std::path::PathBuf;

/// Address of the main instance's relay mailbox for one app id.
///
/// # Platform Behavior
/// - **Windows**: named pipe `\\.\pipe\{id}`
/// - **Unix**: domain socket `{runtime_dir}/{id}.sock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    #[cfg(unix)]
    socket_path: PathBuf,
    #[cfg(windows)]
    pipe_name: String,
}

impl RelayEndpoint {
    pub fn new(runtime_dir: &Path, id: &AppId) -> Self {
        #[cfg(unix)]
        {
            Self {
                socket_path: runtime_dir.join(format!("{}{}", id, RelayConfig::SOCKET_SUFFIX)),
            }
        }

        #[cfg(windows)]
        {
            let _ = runtime_dir;
            Self {
                pipe_name: format!(r"\\.\pipe\{}", id),
            }
        }
    }

    #[cfg(unix)]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[cfg(windows)]
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(unix)]
        {
            write!(f, "{}", self.socket_path.display())
        }

        #[cfg(windows)]
        {
            f.write_str(&self.pipe_name)
        }
    }
}
