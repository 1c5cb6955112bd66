//! Configuration management for stepwise
//!
//! `BuildConfig::default()` holds the built-in defaults. `BuildConfig::from_env()`
//! layers environment variables over them, and command line flags are applied
//! last.
//!
//! # Environment Variables
//!
//! ## Build
//! - `STEPWISE_WORKDIR`: Working directory - default: current directory
//! - `STEPWISE_MANIFEST`: Manifest path, relative to the workdir - default: "build.yml"
//! - `STEPWISE_UNIQUE_ID`: Token mixed into image names - default: empty
//! - `STEPWISE_KEEP_ARTIFACTS`: Keep newly created artifact directories (true|false) - default: "true".
//!   Artifacts are the point of most runs, so they stay unless `--remove-artifacts` is given.
//! - `STEPWISE_KEEP_STEPS`: Keep intermediate step images (true|false) - default: "false"
//! - `STEPWISE_NO_SQUASH`: Skip history squashing (true|false) - default: "false"
//! - `STEPWISE_BUILD_ARGS`: Comma separated `KEY=VALUE` build arguments
//! - `STEPWISE_NO_CACHE`: Build without the daemon's layer cache - default: "false"
//! - `STEPWISE_SUPPRESS_OUTPUT`: Hide daemon build output - default: "false"
//! - `STEPWISE_RM_TMP_CONTAINERS`: Remove intermediate build containers after a successful build - default: "true"
//! - `STEPWISE_FORCE_RM_TMP_CONTAINER`: Always remove intermediate build containers - default: "false"
//! - `STEPWISE_FORCE_RM_IMAGES`: Force removal of step images at the end of the run - default: "false"
//! - `STEPWISE_NO_PRUNE_RM_IMAGES`: Keep untagged parents when removing step images - default: "false"
//! - `STEPWISE_FAILURE_POLICY`: abort-run|continue-independent - default: "abort-run"
//! - `STEPWISE_COMMAND_EXIT_POLICY`: log|fail - default: "log"
//! - `STEPWISE_CANCEL_SIBLINGS`: Cancel in-flight siblings after a failure - default: "false"
//! - `STEPWISE_LOG_LEVEL`: Logging level - default: "info"
//!
//! ## Daemon
//! - `DOCKER_HOST`: Daemon endpoint - default: "unix:///var/run/docker.sock"
//! - `DOCKER_TLS_VERIFY`: Use mutual TLS when set to a non-empty value other than "0"
//! - `DOCKER_CERT_PATH`: Directory holding `ca.pem`, `cert.pem` and `key.pem`

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MANIFEST: &str = "build.yml";
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },

    /// Daemon endpoint could not be understood
    #[error("Invalid daemon endpoint '{0}'. Expected unix://, tcp://, http:// or https://")]
    InvalidEndpoint(String),

    #[error("Could not determine the home directory")]
    MissingHomeDirectory,

    #[error("Failed to read credential file {path}: {reason}")]
    CredentialFile { path: PathBuf, reason: String },
}

/// What happens to later levels once a step has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Every step after the failing level is marked not attempted
    #[default]
    AbortRun,
    /// Steps whose dependencies all succeeded still run
    ContinueIndependent,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort-run" | "abort" => Ok(FailurePolicy::AbortRun),
            "continue-independent" | "continue" => Ok(FailurePolicy::ContinueIndependent),
            other => Err(ConfigError::ParseError {
                field: "failure policy".to_string(),
                error: format!("unknown value '{}'", other),
            }),
        }
    }
}

/// Treatment of a non-zero exit code from a step's ad hoc command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandExitPolicy {
    #[default]
    Log,
    Fail,
}

impl FromStr for CommandExitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" => Ok(CommandExitPolicy::Log),
            "fail" => Ok(CommandExitPolicy::Fail),
            other => Err(ConfigError::ParseError {
                field: "command exit policy".to_string(),
                error: format!("unknown value '{}'", other),
            }),
        }
    }
}

/// Parses a single `KEY=VALUE` build argument.
pub fn parse_build_arg(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::ParseError {
            field: "build argument".to_string(),
            error: format!("'{}' is not of the form KEY=VALUE", s),
        }),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

/// Run-wide build settings
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Directory holding the manifest, the build files and artifact destinations
    pub workdir: PathBuf,

    /// Manifest path, relative to `workdir` unless absolute
    pub manifest_path: PathBuf,

    pub docker_host: String,
    pub use_tls: bool,
    pub docker_cert_path: Option<PathBuf>,

    /// Token inserted into every produced image name
    pub unique_id: String,

    pub keep_artifacts: bool,
    pub keep_steps: bool,
    pub no_squash: bool,

    pub force_rm_images: bool,
    pub no_prune_rm_images: bool,

    pub build_args: Vec<(String, String)>,
    pub no_cache: bool,
    pub suppress_output: bool,
    pub rm_tmp_containers: bool,
    pub force_rm_tmp_container: bool,

    pub failure_policy: FailurePolicy,
    pub command_exit_policy: CommandExitPolicy,
    pub cancel_siblings_on_failure: bool,

    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for BuildConfig {
    /// Built-in defaults. Reads nothing from the environment.
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            use_tls: false,
            docker_cert_path: None,
            unique_id: String::new(),
            keep_artifacts: true,
            keep_steps: false,
            no_squash: false,
            force_rm_images: false,
            no_prune_rm_images: false,
            build_args: Vec::new(),
            no_cache: false,
            suppress_output: false,
            rm_tmp_containers: true,
            force_rm_tmp_container: false,
            failure_policy: FailurePolicy::default(),
            command_exit_policy: CommandExitPolicy::default(),
            cancel_siblings_on_failure: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl BuildConfig {
    /// Loads `STEPWISE_*` and `DOCKER_*` environment variables over the
    /// defaults. Missing or unparsable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let workdir = env::var("STEPWISE_WORKDIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| env::current_dir().ok())
            .unwrap_or(defaults.workdir);

        let manifest_path = env::var("STEPWISE_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or(defaults.manifest_path);

        let docker_host = env::var("DOCKER_HOST")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or(defaults.docker_host);

        let use_tls = env::var("DOCKER_TLS_VERIFY")
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(defaults.use_tls);

        let docker_cert_path = env::var("DOCKER_CERT_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let build_args = env::var("STEPWISE_BUILD_ARGS")
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .filter_map(|s| parse_build_arg(s).ok())
                    .collect()
            })
            .unwrap_or_default();

        let failure_policy = env::var("STEPWISE_FAILURE_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.failure_policy);

        let command_exit_policy = env::var("STEPWISE_COMMAND_EXIT_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.command_exit_policy);

        let log_level = env::var("STEPWISE_LOG_LEVEL")
            .unwrap_or(defaults.log_level)
            .to_lowercase();

        Self {
            workdir,
            manifest_path,
            docker_host,
            use_tls,
            docker_cert_path,
            unique_id: env::var("STEPWISE_UNIQUE_ID").unwrap_or_default(),
            keep_artifacts: env_bool("STEPWISE_KEEP_ARTIFACTS", defaults.keep_artifacts),
            keep_steps: env_bool("STEPWISE_KEEP_STEPS", defaults.keep_steps),
            no_squash: env_bool("STEPWISE_NO_SQUASH", defaults.no_squash),
            force_rm_images: env_bool("STEPWISE_FORCE_RM_IMAGES", defaults.force_rm_images),
            no_prune_rm_images: env_bool("STEPWISE_NO_PRUNE_RM_IMAGES", defaults.no_prune_rm_images),
            build_args,
            no_cache: env_bool("STEPWISE_NO_CACHE", defaults.no_cache),
            suppress_output: env_bool("STEPWISE_SUPPRESS_OUTPUT", defaults.suppress_output),
            rm_tmp_containers: env_bool("STEPWISE_RM_TMP_CONTAINERS", defaults.rm_tmp_containers),
            force_rm_tmp_container: env_bool(
                "STEPWISE_FORCE_RM_TMP_CONTAINER",
                defaults.force_rm_tmp_container,
            ),
            failure_policy,
            command_exit_policy,
            cancel_siblings_on_failure: env_bool(
                "STEPWISE_CANCEL_SIBLINGS",
                defaults.cancel_siblings_on_failure,
            ),
            log_level,
        }
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any validation fails
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workdir.is_dir() {
            return Err(ConfigError::ValidationFailed(format!(
                "Working directory {} does not exist",
                self.workdir.display()
            )));
        }

        if self.use_tls && self.docker_cert_path.is_none() {
            return Err(ConfigError::ValidationFailed(
                "DOCKER_TLS_VERIFY is set but DOCKER_CERT_PATH is not".to_string(),
            ));
        }

        if self
            .unique_id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "Unique id '{}' may only contain letters, digits, '-', '_' and '.'",
                self.unique_id
            )));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    /// Absolute manifest location.
    pub fn manifest_file(&self) -> PathBuf {
        if self.manifest_path.is_absolute() {
            self.manifest_path.clone()
        } else {
            self.workdir.join(&self.manifest_path)
        }
    }

    pub fn build_args_map(&self) -> std::collections::HashMap<String, String> {
        self.build_args.iter().cloned().collect()
    }
}

impl fmt::Display for BuildConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stepwise Configuration:")?;
        writeln!(f, "  Workdir: {}", self.workdir.display())?;
        writeln!(f, "  Manifest: {}", self.manifest_path.display())?;
        writeln!(f, "  Docker Host: {}", self.docker_host)?;
        writeln!(f, "  TLS: {}", self.use_tls)?;
        if !self.unique_id.is_empty() {
            writeln!(f, "  Unique Id: {}", self.unique_id)?;
        }
        writeln!(f, "  Keep Artifacts: {}", self.keep_artifacts)?;
        writeln!(f, "  Keep Steps: {}", self.keep_steps)?;
        writeln!(f, "  Squash: {}", !self.no_squash)?;
        writeln!(f, "  Build Args: {}", self.build_args.len())?;
        writeln!(f, "  Failure Policy: {:?}", self.failure_policy)?;
        writeln!(f, "  Command Exit Policy: {:?}", self.command_exit_policy)?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}
