//! stepwise - multi-step container image builder
//!
//! A build manifest lists steps, each with its own build file. A step whose
//! build file starts `FROM <other step>` depends on that step; stepwise
//! rewrites the reference to the session-unique image name, groups steps
//! into dependency levels and builds each level concurrently against a
//! Docker daemon.
//!
//! After its image is built a step may:
//!
//! - run cleanup commands in a container and squash the result into a
//!   single-layer image
//! - copy artifact files from the container to the host
//! - run an ad hoc command
//!
//! # Example
//!
//! ```no_run
//! use stepwise::{load_manifest, BollardDaemon, BuildConfig, Builder};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = BuildConfig::from_env();
//! let manifest = load_manifest(&config.manifest_file())?;
//! let docker = stepwise::docker::connect(&config)?;
//!
//! let builder = Builder::new(manifest, config, Arc::new(BollardDaemon::new(docker, None)));
//! let report = builder.run().await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```
//!
//! # Project Structure
//!
//! - [`manifest`]: YAML manifest model and loading
//! - [`dockerfile`]: build-file parser and base-image rewriting
//! - [`scheduler`]: dependency levels
//! - [`build`]: step executor, orchestrator and run report
//! - [`docker`]: daemon trait, bollard client, credentials, test double
//! - [`squash`]: image history flattening

pub mod build;
pub mod cli;
pub mod config;
pub mod docker;
pub mod dockerfile;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod squash;
pub mod util;

pub use build::{Builder, RunReport, StepOutcome, StepReport};
pub use config::{BuildConfig, CommandExitPolicy, ConfigError, FailurePolicy};
pub use docker::{BollardDaemon, DockerApi, MockDaemon};
pub use error::{BuildError, DaemonError, ParseError, ScheduleError};
pub use manifest::{load_manifest, parse_manifest, Artifact, Manifest, ManifestError, Step};
pub use scheduler::{schedule, Schedule};
pub use session::Session;
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name_is_stepwise() {
        assert_eq!(NAME, "stepwise");
    }
}
