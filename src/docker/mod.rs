//! Build daemon access
//!
//! [`DockerApi`] is the seam between the executor and the daemon.
//! [`BollardDaemon`] talks to a real engine; [`MockDaemon`] records calls
//! for tests.

pub mod api;
pub mod auth;
pub mod client;
pub mod connection;
pub mod mock;

pub use api::{BuildRequest, DockerApi, ImageRemoval};
pub use auth::{load_credentials, load_credentials_from};
pub use client::{pack_context, BollardDaemon};
pub use connection::{connect, DaemonEndpoint, TlsMaterial};
pub use mock::{DaemonCall, MockDaemon};
