//! Per-role facade state.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::arbiter::{AppId, InstanceLock};
use crate::codec::EventMessage;
use crate::error::{ElixirKitError, Result};
use crate::platform;
use crate::relay::{RelayClient, RelayEndpoint, RelayServer, RelayServerHandle};
use crate::release::{ExitHandler, Release, ReleaseConfig};

/// Options for `MainInstance::start`.
#[derive(Default)]
pub struct StartOptions {
    on_exit: Option<ExitHandler>,
    log_path: Option<PathBuf>,
    env_vars: HashMap<String, String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the release's exit code, off the caller's task.
    pub fn on_exit(mut self, handler: impl FnOnce(i32) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(handler));
        self
    }

    /// Append release output to this file instead of the console.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Extra environment variable for the release.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("on_exit", &self.on_exit.is_some())
            .field("log_path", &self.log_path)
            .field("env_vars", &self.env_vars)
            .finish()
    }
}

/// The invocation that owns the release.
///
/// Holds the instance lock (when an id was given) for its whole lifetime.
/// The relay handle is declared before the lock so the endpoint is torn down
/// before another invocation can win arbitration.
pub struct MainInstance {
    id: Option<AppId>,
    endpoint: Option<RelayEndpoint>,
    app_dir: Option<PathBuf>,
    backend_connect_timeout: Option<Duration>,
    release: Option<Release>,
    relay: Option<RelayServerHandle>,
    _lock: Option<InstanceLock>,
}

impl MainInstance {
    pub(crate) fn new(
        id: Option<AppId>,
        lock: Option<InstanceLock>,
        endpoint: Option<RelayEndpoint>,
        app_dir: Option<PathBuf>,
        backend_connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            endpoint,
            app_dir,
            backend_connect_timeout,
            release: None,
            relay: None,
            _lock: lock,
        }
    }

    pub fn id(&self) -> Option<&AppId> {
        self.id.as_ref()
    }

    /// Directory the release script is resolved against.
    pub fn app_dir(&self) -> Result<PathBuf> {
        match &self.app_dir {
            Some(dir) => Ok(dir.clone()),
            None => platform::current_exe_dir(),
        }
    }

    /// Path `start(name, ..)` would launch.
    pub fn release_path(&self, name: &str) -> Result<PathBuf> {
        Ok(platform::release_script(&self.app_dir()?, name))
    }

    /// Start the release `rel/bin/<name>` next to the application.
    ///
    /// Returns once the release has connected to the control channel. When
    /// this instance has an id, the relay server starts afterwards so
    /// secondary instances can reach the release.
    pub async fn start(&mut self, name: &str, options: StartOptions) -> Result<&Release> {
        let program = self.release_path(name)?;
        let mut config = ReleaseConfig::new(program);
        config.env_vars = options.env_vars;
        if let Some(log_path) = options.log_path {
            config = config.with_log_file(log_path);
        }

        self.start_release(config, options.on_exit).await
    }

    /// Start a release from an explicit configuration.
    ///
    /// `start` resolves the conventional layout and calls this; hosts with a
    /// non-standard layout can call it directly. The builder's backend connect
    /// timeout applies when the configuration does not set one.
    pub async fn start_release(
        &mut self,
        mut config: ReleaseConfig,
        on_exit: Option<ExitHandler>,
    ) -> Result<&Release> {
        if self.release.is_some() {
            return Err(ElixirKitError::AlreadyStarted);
        }
        if config.connect_timeout.is_none() {
            config.connect_timeout = self.backend_connect_timeout;
        }

        let release = Release::start(config, on_exit).await?;

        if let Some(endpoint) = &self.endpoint {
            match RelayServer::start(endpoint.clone(), release.channel().clone()).await {
                Ok(handle) => self.relay = Some(handle),
                Err(e) => {
                    warn!("Relay server failed to start, stopping release: {}", e);
                    release.stop().await;
                    return Err(e);
                }
            }
        }

        Ok(&*self.release.insert(release))
    }

    /// The running release, if started.
    pub fn release(&self) -> Result<&Release> {
        self.release.as_ref().ok_or(ElixirKitError::NotStarted)
    }

    /// Whether the relay server is accepting secondary instances.
    pub fn is_relaying(&self) -> bool {
        self.relay.as_ref().is_some_and(RelayServerHandle::is_running)
    }

    /// Relay endpoint secondary instances connect to, if this instance has an id.
    pub fn relay_endpoint(&self) -> Option<&RelayEndpoint> {
        self.endpoint.as_ref()
    }

    /// Send an event to the release over the control channel.
    pub async fn publish(&self, name: &str, data: &str) -> Result<()> {
        self.release()?.publish(name, data).await
    }

    /// Ask the release to shut down and wait for its exit code.
    ///
    /// Safe to call repeatedly; later calls return the cached exit code.
    pub async fn stop(&self) -> Result<i32> {
        let code = self.release()?.stop().await;
        if let Some(relay) = &self.relay {
            relay.shutdown().await;
        }
        Ok(code)
    }

    pub async fn wait_for_exit(&self) -> Result<i32> {
        Ok(self.release()?.wait_for_exit().await)
    }

    pub fn has_exited(&self) -> Result<bool> {
        Ok(self.release()?.has_exited())
    }

    /// Log file the release writes to, if one was configured.
    pub fn log_path(&self) -> Option<&Path> {
        self.release.as_ref().and_then(Release::log_path)
    }
}

impl fmt::Debug for MainInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainInstance")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("started", &self.release.is_some())
            .field("relaying", &self.is_relaying())
            .finish()
    }
}

/// A later invocation that forwards events to the main instance.
#[derive(Debug, Clone)]
pub struct SecondaryInstance {
    id: AppId,
    client: RelayClient,
}

impl SecondaryInstance {
    pub(crate) fn new(id: AppId, client: RelayClient) -> Self {
        Self { id, client }
    }

    pub fn id(&self) -> &AppId {
        &self.id
    }

    pub fn relay_endpoint(&self) -> &RelayEndpoint {
        self.client.endpoint()
    }

    /// Relay an event to the main instance's release.
    pub async fn publish(&self, name: &str, data: &str) -> Result<()> {
        let message = EventMessage::new(name, data)?;
        self.client.publish(&message).await?;
        info!("Relayed {:?} event to main instance of {}", name, self.id);
        Ok(())
    }
}
