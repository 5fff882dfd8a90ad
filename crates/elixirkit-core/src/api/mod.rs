//! Facade implementation submodules.
//!
//! The role-dispatching `ElixirKit` enum lives in `lib.rs`; the per-role
//! state and the builder live here.

mod builder;
mod instance;

pub use builder::ElixirKitBuilder;
pub use instance::{MainInstance, SecondaryInstance, StartOptions};
