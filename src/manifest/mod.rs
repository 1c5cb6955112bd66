//! Build manifest model
//!
//! A manifest is an ordered list of steps. Steps never point back at the
//! manifest; sibling lookups go through [`Manifest::find_step`].

mod loader;

pub use loader::{load_manifest, parse_manifest, ManifestError};

use std::path::PathBuf;

/// One file to copy out of a step's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Absolute path inside the container
    pub source: String,
    /// Host directory, relative to the build working directory
    pub dest: PathBuf,
}

impl Artifact {
    pub fn new(source: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
        }
    }

    /// File name the artifact is written under on the host.
    pub fn file_name(&self) -> &str {
        self.source
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.source)
    }
}

/// One build unit producing exactly one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Logical name, also the base of the produced image name
    pub name: String,
    /// Manifest key the step was declared under
    pub label: String,
    /// Build file path relative to the working directory
    pub dockerfile: PathBuf,
    pub command: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// Commands run inside a transient container before squashing
    pub cleanup: Vec<String>,
    /// Explicit dependencies, by label or name
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, dockerfile: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            dockerfile: dockerfile.into(),
            command: None,
            artifacts: Vec::new(),
            cleanup: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_cleanup(mut self, command: impl Into<String>) -> Self {
        self.cleanup.push(command.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    /// Whether the step needs a container after its image is built.
    pub fn needs_container(&self) -> bool {
        !self.artifacts.is_empty() || !self.cleanup.is_empty() || self.command.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub steps: Vec<Step>,
}

impl Manifest {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Finds the step whose logical name is exactly `name`.
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Resolves an explicit `depends_on` entry, trying labels before names.
    pub fn resolve_reference(&self, reference: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.label == reference)
            .or_else(|| self.position(reference))
    }

    /// The step whose image is kept at the end of the run.
    pub fn final_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
