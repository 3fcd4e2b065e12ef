//! Server side of the vireo connector framework.
//!
//! A [`Host`] owns sessions. Each [`Session`] holds one connector tree ([`ConnectorTracker`])
//! behind an exclusive lock with a bounded wait; every mutation, whether from a client request
//! or a background thread, runs under that lock. The [`CommunicationManager`] of the session
//! validates incoming requests, dispatches their invocations before collecting changes, and
//! writes the response. With push enabled, changes made outside a request are sent over the
//! session's [`PushConnection`].
//!
//! The client runtime and everything shared by both sides lives in [`vireo_core`].

pub mod communication;
pub mod component;
pub mod config;
mod host;
pub mod push;
pub mod session;
pub mod tracker;

pub use communication::CommunicationManager;
pub use component::ServerConnector;
pub use config::{Config, ConfigError};
pub use host::{Host, Sweeper};
pub use push::{PushConnection, PushMode};
pub use session::Session;
pub use tracker::ConnectorTracker;
pub use vireo_core;
