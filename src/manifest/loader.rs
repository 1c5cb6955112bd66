use super::{Artifact, Manifest, Step};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Manifest defines no build steps")]
    NoSteps,

    #[error("Step key must be a string, found {0:?}")]
    InvalidStepKey(serde_yaml::Value),

    #[error("Duplicate step name '{0}'")]
    DuplicateName(String),

    #[error("Step '{0}' has no dockerfile")]
    MissingDockerfile(String),

    #[error("Artifact '{artifact}' of step '{step}' must be an absolute container path")]
    RelativeArtifact { step: String, artifact: String },

    #[error("Artifact '{artifact}' of step '{step}' must have a destination inside the working directory")]
    DestinationOutsideWorkdir { step: String, artifact: String },
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    build: BuildSection,
}

#[derive(Debug, Deserialize)]
struct BuildSection {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    steps: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDef {
    name: Option<String>,
    #[serde(default)]
    dockerfile: String,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    cleanup: Option<CleanupDef>,
    #[serde(default)]
    depends_on: Vec<String>,
    command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CleanupDef {
    #[serde(default)]
    commands: Vec<String>,
}

/// Reads and validates a YAML manifest from disk.
pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded manifest from {}", path.display());
    parse_manifest(&content)
}

/// Parses and validates a YAML manifest. Steps keep declaration order.
pub fn parse_manifest(content: &str) -> Result<Manifest, ManifestError> {
    let file: ManifestFile = serde_yaml::from_str(content)?;

    let mut steps = Vec::with_capacity(file.build.steps.len());
    for (key, value) in file.build.steps {
        let label = match key {
            serde_yaml::Value::String(s) => s,
            other => return Err(ManifestError::InvalidStepKey(other)),
        };
        let def: StepDef = serde_yaml::from_value(value)?;
        steps.push(into_step(label, def)?);
    }

    let manifest = Manifest::new(steps);
    validate(&manifest)?;
    Ok(manifest)
}

fn into_step(label: String, def: StepDef) -> Result<Step, ManifestError> {
    let name = def
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| label.clone());

    let artifacts = def
        .artifacts
        .iter()
        .map(|spec| parse_artifact(&name, spec))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Step {
        name,
        label,
        dockerfile: PathBuf::from(def.dockerfile.trim()),
        command: def.command.filter(|c| !c.trim().is_empty()),
        artifacts,
        cleanup: def.cleanup.map(|c| c.commands).unwrap_or_default(),
        depends_on: def.depends_on,
    })
}

/// `source[:dest]`, dest defaulting to the working directory itself.
fn parse_artifact(step: &str, spec: &str) -> Result<Artifact, ManifestError> {
    let (source, dest) = match spec.split_once(':') {
        Some((source, dest)) if !dest.is_empty() => (source, dest),
        Some((source, _)) => (source, "."),
        None => (spec, "."),
    };

    if !source.starts_with('/') {
        return Err(ManifestError::RelativeArtifact {
            step: step.to_string(),
            artifact: spec.to_string(),
        });
    }

    if !stays_inside(Path::new(dest)) {
        return Err(ManifestError::DestinationOutsideWorkdir {
            step: step.to_string(),
            artifact: spec.to_string(),
        });
    }

    Ok(Artifact::new(source, dest))
}

/// True for relative paths whose `..` components never climb above the start.
fn stays_inside(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn validate(manifest: &Manifest) -> Result<(), ManifestError> {
    if manifest.is_empty() {
        return Err(ManifestError::NoSteps);
    }

    let mut seen = HashSet::new();
    for step in &manifest.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ManifestError::DuplicateName(step.name.clone()));
        }
        if step.dockerfile.as_os_str().is_empty() {
            return Err(ManifestError::MissingDockerfile(step.name.clone()));
        }
    }

    Ok(())
}
