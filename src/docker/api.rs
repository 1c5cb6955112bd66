use crate::error::DaemonError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One image build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    /// Name the image is tagged with
    pub tag: String,
    /// Build file path relative to `context`
    pub dockerfile: String,
    /// Directory sent as the build context
    pub context: PathBuf,
    pub build_args: HashMap<String, String>,
    pub no_cache: bool,
    pub suppress_output: bool,
    /// Remove intermediate containers after a successful build
    pub remove_intermediate: bool,
    /// Always remove intermediate containers
    pub force_remove_intermediate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageRemoval {
    pub force: bool,
    pub no_prune: bool,
}

/// Daemon operations used by the step executor.
///
/// Implementations must be safe to share between concurrently running
/// steps; every call is independent.
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn build_image(&self, request: &BuildRequest) -> Result<(), DaemonError>;

    /// Creates a container running the default shell. Returns its id.
    async fn create_container(&self, name: &str, image: &str) -> Result<String, DaemonError>;

    async fn start_container(&self, id: &str) -> Result<(), DaemonError>;

    async fn stop_container(&self, id: &str) -> Result<(), DaemonError>;

    /// Force-removes a container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), DaemonError>;

    /// Returns the exec id.
    async fn create_exec(&self, container: &str, cmd: &[String], tty: bool) -> Result<String, DaemonError>;

    /// Runs an exec to completion and returns its combined output.
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<String, DaemonError>;

    /// Exit code of a finished exec.
    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, DaemonError>;

    /// Commits a container as `repo:tag`.
    async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> Result<(), DaemonError>;

    /// Streams an image archive into `dest`.
    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), DaemonError>;

    /// Loads an image archive from `archive`.
    async fn load_image(&self, archive: &Path) -> Result<(), DaemonError>;

    /// Returns a tar archive holding `path` from the container filesystem.
    async fn download_from_container(&self, container: &str, path: &str) -> Result<Vec<u8>, DaemonError>;

    async fn remove_image(&self, image: &str, options: ImageRemoval) -> Result<(), DaemonError>;
}
