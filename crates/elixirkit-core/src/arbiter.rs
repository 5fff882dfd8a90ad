//! Instance arbitration.
//!
//! Decides whether this invocation is the main instance for an application id
//! by taking an exclusive, non-blocking lock on `<runtime_dir>/<id>.lock`.
//!
//! The lock is an advisory OS file lock (`flock` on Unix, `LockFileEx` on
//! Windows). The OS drops it when the owning process terminates, so a crashed
//! main instance never blocks later launches.

use crate::config::RelayConfig;
use crate::error::{ElixirKitError, Result};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Identity shared by every invocation of one logical application.
///
/// Names both the instance lock and the relay endpoint, so it must be usable
/// as a file name and as a Windows pipe name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppId(String);

impl AppId {
    /// Longest accepted id. Unix socket paths are limited to ~100 bytes.
    pub const MAX_LEN: usize = 64;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= Self::MAX_LEN
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', ':', '\0'])
            && !id.chars().any(char::is_control);

        if valid {
            Ok(Self(id))
        } else {
            Err(ElixirKitError::InvalidAppId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of this invocation, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Main,
    Secondary,
}

/// Held exclusive lock marking this process as the main instance.
///
/// Released when dropped or when the process exits.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock for `id` without blocking.
    ///
    /// Returns `Ok(None)` when another process (or another handle in this
    /// process) already holds it. Any other failure is fatal.
    pub fn try_acquire(runtime_dir: &Path, id: &AppId) -> Result<Option<Self>> {
        fs::create_dir_all(runtime_dir)
            .map_err(|e| ElixirKitError::io_with_path(e, runtime_dir))?;

        let path = runtime_dir.join(format!("{}{}", id, RelayConfig::LOCK_SUFFIX));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| ElixirKitError::LockFailed {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                debug!("Instance lock {} is held elsewhere", path.display());
                return Ok(None);
            }
            Err(source) => return Err(ElixirKitError::LockFailed { path, source }),
        }

        let mut lock = Self { file, path };
        lock.record_owner();
        info!("Acquired instance lock {}", lock.path.display());
        Ok(Some(lock))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write our PID into the lock file for diagnostics. Best effort.
    fn record_owner(&mut self) {
        let result = self
            .file
            .set_len(0)
            .and_then(|_| write!(self.file, "{}", std::process::id()))
            .and_then(|_| self.file.flush());
        if let Err(e) = result {
            debug!("Could not record owner in {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Outcome of arbitration. The main variant carries the lock it won.
#[derive(Debug)]
pub enum Arbitration {
    /// `lock` is `None` when no app id was given (single-instance is opt-in).
    Main { lock: Option<InstanceLock> },
    Secondary,
}

impl Arbitration {
    pub fn role(&self) -> InstanceRole {
        match self {
            Arbitration::Main { .. } => InstanceRole::Main,
            Arbitration::Secondary => InstanceRole::Secondary,
        }
    }
}

/// Decides main vs. secondary for invocations sharing a runtime directory.
#[derive(Debug, Clone)]
pub struct Arbiter {
    runtime_dir: PathBuf,
}

impl Arbiter {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Run arbitration once. Without an id this is always the main instance.
    pub fn arbitrate(&self, id: Option<&AppId>) -> Result<Arbitration> {
        let Some(id) = id else {
            return Ok(Arbitration::Main { lock: None });
        };

        match InstanceLock::try_acquire(&self.runtime_dir, id)? {
            Some(lock) => Ok(Arbitration::Main { lock: Some(lock) }),
            None => {
                info!("Another instance of {} is running, acting as secondary", id);
                Ok(Arbitration::Secondary)
            }
        }
    }
}
