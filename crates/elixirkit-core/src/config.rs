//! Centralized configuration for ElixirKit.
//!
//! Fixed protocol constants live on the unit structs below. Values a host may
//! want to tune at runtime are exposed through `ElixirKitBuilder` and default to
//! the constants defined here.

use std::time::Duration;

/// Control channel (front end -> release) configuration.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Environment variable carrying the loopback port the release connects back to.
    pub const PORT_ENV_VAR: &'static str = "ELIXIRKIT_PORT";
    /// Line terminator appended to every frame.
    pub const LINE_TERMINATOR: &'static str = "\n";
}

/// Relay (secondary -> main instance) configuration.
pub struct RelayConfig;

impl RelayConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Retry interval while the main instance's endpoint is missing or busy.
    pub const CONNECT_RETRY: Duration = Duration::from_millis(50);
    /// Pause after a failed accept before accepting again.
    pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
    /// Longest line the relay server reads from a single client.
    pub const MAX_LINE_BYTES: u64 = 1024 * 1024;
    pub const SOCKET_SUFFIX: &'static str = ".sock";
    pub const LOCK_SUFFIX: &'static str = ".lock";
    pub const RUNTIME_DIR_NAME: &'static str = "elixirkit";
}

/// On-disk layout of a release next to the front-end executable.
pub struct ReleaseLayout;

impl ReleaseLayout {
    pub const REL_DIR_NAME: &'static str = "rel";
    pub const BIN_DIR_NAME: &'static str = "bin";
    /// Subcommand every release script is invoked with.
    pub const START_COMMAND: &'static str = "start";
    /// Release scripts are batch files on Windows.
    pub const WINDOWS_SCRIPT_EXTENSION: &'static str = "bat";
    /// How long output readers may keep draining after the release exits.
    pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
    pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;
}
