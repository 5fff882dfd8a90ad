//! ElixirKit - single-instance arbitration and event delivery for desktop
//! front ends that own a long-running release process.
//!
//! The first invocation of an application becomes the main instance: it
//! spawns the release, hands it a loopback port through `ELIXIRKIT_PORT`, and
//! pushes events to it as `event:<name>:<base64>` lines. Later invocations of
//! the same application id become secondary instances and relay their events
//! to the main instance over a named pipe (Unix domain socket on Unix).
//!
//! # Example
//!
//! ```rust,ignore
//! use elixirkit::{ElixirKit, StartOptions};
//!
//! #[tokio::main]
//! async fn main() -> elixirkit::Result<()> {
//!     let mut kit = ElixirKit::new(Some("com.example.Demo"))?;
//!
//!     if let ElixirKit::Main(main) = &mut kit {
//!         main.start("demo", StartOptions::new()).await?;
//!     }
//!     kit.publish("log", "Hello from Windows Forms!").await?;
//!
//!     if kit.is_main() {
//!         let code = kit.stop().await?;
//!         println!("Release exited with code {}", code);
//!     }
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod platform;
pub mod relay;
pub mod release;

mod api;

// Re-export commonly used types
pub use api::{ElixirKitBuilder, MainInstance, SecondaryInstance, StartOptions};
pub use arbiter::{AppId, InstanceRole};
pub use channel::{ControlChannel, EventSink};
pub use codec::{encode_event, EventMessage};
pub use error::{ElixirKitError, Result};
pub use relay::{RelayClient, RelayEndpoint, RelayServer, RelayServerHandle};
pub use release::{ExitHandler, LogSink, OutputLine, OutputStream, Release, ReleaseConfig};

/// Facade over one invocation of an application.
///
/// The role is decided once, when the value is built, and the variant carries
/// only what that role may do: the main instance owns the release and the
/// relay server, a secondary instance owns nothing but a relay client.
///
/// The convenience methods below dispatch on the variant; main-only
/// operations called on a secondary instance fail with `NotMainInstance`.
#[derive(Debug)]
pub enum ElixirKit {
    Main(MainInstance),
    Secondary(SecondaryInstance),
}

impl ElixirKit {
    /// Create a builder for ElixirKit.
    ///
    /// Use the builder to override the runtime directory, the release
    /// location, or the connect timeouts.
    pub fn builder() -> ElixirKitBuilder {
        ElixirKitBuilder::new()
    }

    /// Run instance arbitration for `id` with default settings.
    ///
    /// Without an id this is always the main instance.
    pub fn new(id: Option<&str>) -> Result<Self> {
        let mut builder = ElixirKitBuilder::new();
        if let Some(id) = id {
            builder = builder.id(id);
        }
        builder.build()
    }

    /// Returns true if this invocation owns the release.
    pub fn is_main(&self) -> bool {
        matches!(self, ElixirKit::Main(_))
    }

    pub fn role(&self) -> InstanceRole {
        match self {
            ElixirKit::Main(_) => InstanceRole::Main,
            ElixirKit::Secondary(_) => InstanceRole::Secondary,
        }
    }

    pub fn id(&self) -> Option<&AppId> {
        match self {
            ElixirKit::Main(main) => main.id(),
            ElixirKit::Secondary(secondary) => Some(secondary.id()),
        }
    }

    /// Get the main instance, or error if this is a secondary instance.
    pub fn as_main(&self, operation: &'static str) -> Result<&MainInstance> {
        match self {
            ElixirKit::Main(main) => Ok(main),
            ElixirKit::Secondary(_) => Err(ElixirKitError::NotMainInstance { operation }),
        }
    }

    /// Mutable variant of `as_main`.
    pub fn as_main_mut(&mut self, operation: &'static str) -> Result<&mut MainInstance> {
        match self {
            ElixirKit::Main(main) => Ok(main),
            ElixirKit::Secondary(_) => Err(ElixirKitError::NotMainInstance { operation }),
        }
    }

    /// Publish an event to the release.
    ///
    /// The main instance writes to the control channel directly; a secondary
    /// instance relays through the main instance.
    pub async fn publish(&self, name: &str, data: &str) -> Result<()> {
        match self {
            ElixirKit::Main(main) => main.publish(name, data).await,
            ElixirKit::Secondary(secondary) => secondary.publish(name, data).await,
        }
    }

    /// Start the release. Main instance only.
    pub async fn start(&mut self, name: &str, options: StartOptions) -> Result<&Release> {
        self.as_main_mut("start")?.start(name, options).await
    }

    /// Stop the release and return its exit code. Main instance only.
    pub async fn stop(&self) -> Result<i32> {
        self.as_main("stop")?.stop().await
    }

    /// Wait for the release to exit. Main instance only.
    pub async fn wait_for_exit(&self) -> Result<i32> {
        self.as_main("wait_for_exit")?.wait_for_exit().await
    }

    /// Whether the release has exited. Main instance only.
    pub fn has_exited(&self) -> Result<bool> {
        self.as_main("has_exited")?.has_exited()
    }
}
