//! Builder for configuring ElixirKit initialization.

use std::path::PathBuf;
use std::time::Duration;

use crate::api::{MainInstance, SecondaryInstance};
use crate::arbiter::{AppId, Arbiter, Arbitration};
use crate::config::RelayConfig;
use crate::error::Result;
use crate::platform;
use crate::relay::{RelayClient, RelayEndpoint};
use crate::ElixirKit;

/// Builder for configuring ElixirKit initialization.
///
/// # Example
///
/// ```rust,ignore
/// use elixirkit::ElixirKit;
///
/// let kit = ElixirKit::builder()
///     .id("dev.livebook.Livebook")
///     .relay_connect_timeout(Duration::from_secs(2))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ElixirKitBuilder {
    id: Option<String>,
    runtime_dir: Option<PathBuf>,
    app_dir: Option<PathBuf>,
    relay_connect_timeout: Duration,
    backend_connect_timeout: Option<Duration>,
}

impl Default for ElixirKitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElixirKitBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            runtime_dir: None,
            app_dir: None,
            relay_connect_timeout: RelayConfig::CONNECT_TIMEOUT,
            backend_connect_timeout: None,
        }
    }

    /// Application id shared by every invocation of the app.
    ///
    /// Without an id every invocation is a main instance and no relay runs.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Directory for the instance lock and the Unix relay socket.
    ///
    /// Default: `platform::default_runtime_dir()`
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Directory the `rel/bin/<name>` release script is resolved against.
    ///
    /// Default: the directory of the running executable
    pub fn app_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.app_dir = Some(dir.into());
        self
    }

    /// How long a secondary instance waits for the main instance's relay.
    ///
    /// Default: 5 seconds
    pub fn relay_connect_timeout(mut self, timeout: Duration) -> Self {
        self.relay_connect_timeout = timeout;
        self
    }

    /// Bound on waiting for the release to connect back after spawn.
    ///
    /// Default: `None` (wait until the release connects or exits)
    pub fn backend_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.backend_connect_timeout = timeout;
        self
    }

    /// Run instance arbitration and build the facade for the resulting role.
    pub fn build(self) -> Result<ElixirKit> {
        let id = self.id.map(AppId::new).transpose()?;
        let runtime_dir = self
            .runtime_dir
            .unwrap_or_else(platform::default_runtime_dir);
        let arbiter = Arbiter::new(runtime_dir);

        // Without an id single-instance enforcement is off: always main, no relay.
        let Some(id) = id else {
            return Ok(ElixirKit::Main(MainInstance::new(
                None,
                None,
                None,
                self.app_dir,
                self.backend_connect_timeout,
            )));
        };

        let endpoint = RelayEndpoint::new(arbiter.runtime_dir(), &id);
        let kit = match arbiter.arbitrate(Some(&id))? {
            Arbitration::Main { lock } => ElixirKit::Main(MainInstance::new(
                Some(id),
                lock,
                Some(endpoint),
                self.app_dir,
                self.backend_connect_timeout,
            )),
            Arbitration::Secondary => {
                let client =
                    RelayClient::new(endpoint).with_connect_timeout(self.relay_connect_timeout);
                ElixirKit::Secondary(SecondaryInstance::new(id, client))
            }
        };

        Ok(kit)
    }
}
