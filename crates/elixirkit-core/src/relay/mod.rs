//! Relay between secondary instances and the main instance.
//!
//! A secondary invocation cannot talk to the release directly; it hands its
//! event line to the main instance, which forwards it onto the control channel.
//!
//! # Architecture
//!
//! - **Endpoint**: name of the mailbox, derived from the app id
//! - **Server**: runs on the main instance, accepts one client at a time,
//!   reads one line, forwards it, and goes back to waiting
//! - **Client**: used by secondary instances; connect, write one line, close
//!
//! The transport is a named pipe on Windows and a Unix domain socket elsewhere.

pub mod client;
pub mod endpoint;
pub mod server;

pub use client::RelayClient;
pub use endpoint::RelayEndpoint;
pub use server::{RelayServer, RelayServerHandle};
