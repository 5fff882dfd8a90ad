//! Error types for ElixirKit.
//!
//! Variants are grouped by how callers are expected to react: role violations
//! are programming errors, transport errors surface to the caller of
//! `publish`/`send`, spawn errors are fatal at `start`, and codec errors mark a
//! line that must never reach the backend.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for ElixirKit.
#[derive(Debug, Error)]
pub enum ElixirKitError {
    // Role violations
    #[error("{operation} is only available on the main instance")]
    NotMainInstance { operation: &'static str },

    #[error("Release has not been started")]
    NotStarted,

    #[error("Release already started")]
    AlreadyStarted,

    // Transport errors
    #[error("Control channel is closed")]
    ChannelClosed,

    #[error("Relay endpoint {endpoint} unavailable: {reason}")]
    RelayUnavailable { endpoint: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Process spawn errors
    #[error("Release executable not found: {0}")]
    ReleaseNotFound(PathBuf),

    #[error("Failed to launch {program}: {message}")]
    LaunchFailed { program: PathBuf, message: String },

    #[error("Release exited with code {code} before connecting to the control channel")]
    BackendExited { code: i32 },

    // Codec errors
    #[error("Invalid event name {name:?}: {reason}")]
    InvalidEventName { name: String, reason: &'static str },

    #[error("Malformed event line {line:?}: {reason}")]
    MalformedLine { line: String, reason: String },

    // Arbiter errors
    #[error("Invalid app ID: {0:?}")]
    InvalidAppId(String),

    #[error("Failed to acquire instance lock at {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for ElixirKit operations.
pub type Result<T> = std::result::Result<T, ElixirKitError>;

impl From<std::io::Error> for ElixirKitError {
    fn from(err: std::io::Error) -> Self {
        ElixirKitError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl ElixirKitError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ElixirKitError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error came from a write or connect on a channel or pipe.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ElixirKitError::ChannelClosed
                | ElixirKitError::RelayUnavailable { .. }
                | ElixirKitError::Timeout(_)
                | ElixirKitError::Io { .. }
        )
    }

    /// Whether this error means the caller used an operation its role does not allow.
    pub fn is_role_violation(&self) -> bool {
        matches!(
            self,
            ElixirKitError::NotMainInstance { .. }
                | ElixirKitError::NotStarted
                | ElixirKitError::AlreadyStarted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ElixirKitError::NotMainInstance { operation: "stop" };
        assert_eq!(err.to_string(), "stop is only available on the main instance");

        let err = ElixirKitError::BackendExited { code: 3 };
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ElixirKitError = io.into();
        assert!(err.is_transport());
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_io_with_path_keeps_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        match ElixirKitError::io_with_path(io, "/tmp/app.log") {
            ElixirKitError::Io { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/app.log")));
            }
            other => panic!("Expected Io, got: {:?}", other),
        }
    }

    #[test]
    fn test_classification() {
        assert!(ElixirKitError::ChannelClosed.is_transport());
        assert!(!ElixirKitError::ChannelClosed.is_role_violation());
        assert!(ElixirKitError::NotStarted.is_role_violation());
        assert!(!ElixirKitError::InvalidAppId("a/b".into()).is_transport());
    }
}
