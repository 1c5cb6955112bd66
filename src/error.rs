//! Error types for stepwise
//!
//! Each layer has its own error enum; `BuildError` is the umbrella a single
//! step can fail with and is what ends up in the run report.

use std::path::PathBuf;
use thiserror::Error;

/// A build-instruction file could not be parsed. Line 0 means no line applies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{}", line_prefix(.line), .message)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

fn line_prefix(line: &usize) -> String {
    match line {
        0 => String::new(),
        n => format!("line {}: ", n),
    }
}

/// Errors raised while talking to the build daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Image load failed: {0}")]
    LoadFailed(String),

    #[error("Invalid daemon endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("I/O error while streaming daemon data: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors produced while computing dependency levels.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle detected between steps: {}", .steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("Failed to read build file {path} for step '{step}': {source}")]
    Io {
        step: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse build file for step '{step}': {source}")]
    Parse {
        step: String,
        #[source]
        source: ParseError,
    },
}

/// Errors produced by the history squasher.
#[derive(Debug, Error)]
pub enum SquashError {
    #[error("I/O error during squash: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid image metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    #[error("Image archive is missing {0}")]
    MissingEntry(String),

    #[error("Squash worker failed: {0}")]
    Worker(String),
}

/// Errors produced while copying artifacts to the host.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Unsupported archive entry {path} for artifact {source_path} (only regular files can be extracted)")]
    UnsupportedEntry { source_path: String, path: String },

    #[error("Archive for artifact {0} contained no regular file")]
    Empty(String),

    #[error("Failed to write artifact to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that can abort a single step.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to parse build file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("Invalid build file {path}: {reason}")]
    InvalidBuildFile { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Squash(#[from] SquashError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Command '{command}' exited with code {exit_code}")]
    CommandFailed { command: String, exit_code: i64 },

    #[error("Step cancelled after a sibling step failed")]
    Cancelled,
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}
