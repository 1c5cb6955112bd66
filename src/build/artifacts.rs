//! Copying artifact files from containers to the host

use crate::error::ArtifactError;
use crate::manifest::{Artifact, Manifest};
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info};

/// Owner bits always added so the host user can replace or delete the file.
pub const OWNER_RWX: u32 = 0o700;

/// Command reading the permission bits of a container path.
pub fn stat_command(source: &str) -> Vec<String> {
    vec![
        "stat".to_string(),
        "--format=%a".to_string(),
        source.to_string(),
    ]
}

/// Parses `stat --format=%a` output, which is octal.
pub fn parse_mode(output: &str) -> Option<u32> {
    let cleaned = output.trim().trim_matches('\'');
    u32::from_str_radix(cleaned, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
}

/// Normal components of `dest/file_name` after resolving `..` lexically.
/// Root and prefix components are dropped, so the result never leaves the
/// directory it is joined to.
fn confined_parts(artifact: &Artifact) -> Vec<&OsStr> {
    let relative = Path::new(&artifact.dest);
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in relative.components().chain(Path::new(artifact.file_name()).components()) {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts
}

/// Host path an artifact is written to, always below `workdir`.
pub fn destination(artifact: &Artifact, workdir: &Path) -> PathBuf {
    let mut path = workdir.to_path_buf();
    path.extend(confined_parts(artifact));
    path
}

/// The topmost missing path on the way to each artifact destination.
///
/// Removing these after the run deletes exactly what the run created.
pub fn collect_artifact_roots(manifest: &Manifest, workdir: &Path) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();

    for artifact in manifest.steps.iter().flat_map(|s| s.artifacts.iter()) {
        let mut current = workdir.to_path_buf();

        for part in confined_parts(artifact) {
            current.push(part);
            if !current.exists() {
                if !roots.contains(&current) {
                    roots.push(current.clone());
                }
                break;
            }
        }
    }

    roots
}

/// Removes collected roots. Overlapping roots may already be gone.
pub fn remove_artifact_roots(roots: &[PathBuf]) {
    for root in roots {
        debug!("Removing artifact path: {}", root.display());
        let result = if root.is_dir() {
            std::fs::remove_dir_all(root)
        } else {
            std::fs::remove_file(root)
        };
        if let Err(e) = result {
            debug!("Ignoring failure to remove {}: {}", root.display(), e);
        }
    }
}

/// Writes the regular file held by `archive` to the artifact destination and
/// applies `mode | OWNER_RWX`.
pub fn extract_archive(
    archive: &[u8],
    artifact: &Artifact,
    workdir: &Path,
    mode: Option<u32>,
) -> Result<PathBuf, ArtifactError> {
    let target = destination(artifact, workdir);
    let io_err = |source: std::io::Error| ArtifactError::Io {
        path: target.clone(),
        source,
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ArtifactError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut written = false;
    let mut reader = Archive::new(archive);
    for entry in reader.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                info!("Copying from {} to {}", artifact.source, target.display());
                let mut file = File::create(&target).map_err(io_err)?;
                std::io::copy(&mut entry, &mut file).map_err(io_err)?;
                written = true;
            }
            EntryType::XHeader | EntryType::XGlobalHeader | EntryType::GNULongName | EntryType::GNULongLink => {}
            _ => {
                let path = entry
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                return Err(ArtifactError::UnsupportedEntry {
                    source_path: artifact.source.clone(),
                    path,
                });
            }
        }
    }

    if !written {
        return Err(ArtifactError::Empty(artifact.source.clone()));
    }

    apply_mode(&target, mode.unwrap_or(0) | OWNER_RWX).map_err(io_err)?;
    Ok(target)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    debug!("Setting file permissions for {} to {:o}", path.display(), mode);
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
