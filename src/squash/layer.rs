use super::Squasher;
use crate::error::SquashError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

#[derive(Debug)]
struct FlatEntry {
    header: Header,
    link: Option<PathBuf>,
    data: Vec<u8>,
}

impl FlatEntry {
    fn is_dir(&self) -> bool {
        self.header.entry_type() == EntryType::Directory
    }
}

#[derive(Debug)]
enum Hidden {
    /// The path and everything below it
    Path(String),
    /// Everything below the directory, not the directory itself
    Children(String),
}

impl Hidden {
    fn covers(&self, path: &str) -> bool {
        match self {
            Hidden::Path(p) => path == p || is_below(path, p),
            Hidden::Children(dir) => is_below(path, dir),
        }
    }
}

fn is_below(path: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return !path.is_empty();
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

fn normalize(path: &Path) -> String {
    let raw = path.to_string_lossy();
    raw.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Adds `:latest` when the reference has no tag.
fn tagged(target: &str) -> String {
    let name_part = target.rsplit('/').next().unwrap_or(target);
    if name_part.contains(':') || target.contains('@') {
        target.to_string()
    } else {
        format!("{}:latest", target)
    }
}

fn sha256_file(path: &Path) -> Result<String, SquashError> {
    let mut hasher = Sha256::new();
    let mut reader = BufReader::new(File::open(path)?);
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Squashes `docker save` archives into a single layer.
///
/// Layers are applied from the top down. Whiteouts only hide entries of the
/// layers below the one carrying them.
#[derive(Debug, Default, Clone)]
pub struct LayerSquasher;

impl LayerSquasher {
    pub fn new() -> Self {
        Self
    }

    fn flatten(&self, root: &Path, layers: &[String]) -> Result<BTreeMap<String, FlatEntry>, SquashError> {
        let mut entries: BTreeMap<String, FlatEntry> = BTreeMap::new();
        let mut hidden: Vec<Hidden> = Vec::new();

        for layer in layers.iter().rev() {
            let layer_path = root.join(layer);
            if !layer_path.is_file() {
                return Err(SquashError::MissingEntry(layer.clone()));
            }

            let mut pending_hidden = Vec::new();
            let mut archive = Archive::new(BufReader::new(File::open(&layer_path)?));

            for entry in archive.entries()? {
                let mut entry = entry?;
                let path = normalize(&entry.path()?);
                if path.is_empty() {
                    continue;
                }

                let (parent, name) = split_parent(&path);
                if name == OPAQUE_MARKER {
                    pending_hidden.push(Hidden::Children(parent.to_string()));
                    continue;
                }
                if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                    pending_hidden.push(Hidden::Path(join(parent, target)));
                    continue;
                }

                if entries.contains_key(&path) || hidden.iter().any(|h| h.covers(&path)) {
                    continue;
                }
                if shadowed_by_file(&entries, &path) {
                    continue;
                }

                let header = entry.header().clone();
                let link = entry.link_name()?.map(|l| l.into_owned());
                let mut data = Vec::new();
                if header.entry_type().is_file() {
                    entry.read_to_end(&mut data)?;
                }
                entries.insert(path, FlatEntry { header, link, data });
            }

            debug!("Applied layer {} ({} entries so far)", layer, entries.len());
            hidden.extend(pending_hidden);
        }

        Ok(entries)
    }

    fn write_layer(&self, entries: &BTreeMap<String, FlatEntry>, dest: &Path) -> Result<(), SquashError> {
        let mut builder = Builder::new(BufWriter::new(File::create(dest)?));

        // hard links must follow their targets
        let (links, others): (Vec<_>, Vec<_>) = entries
            .iter()
            .partition(|(_, e)| e.header.entry_type() == EntryType::Link);

        for (path, entry) in others.into_iter().chain(links) {
            let mut header = entry.header.clone();
            let name = if entry.is_dir() {
                format!("{}/", path)
            } else {
                path.clone()
            };
            match &entry.link {
                Some(target) => builder.append_link(&mut header, &name, target)?,
                None => builder.append_data(&mut header, &name, entry.data.as_slice())?,
            }
        }

        builder.into_inner()?.flush()?;
        Ok(())
    }
}

/// True when an ancestor of `path` was already placed as a non-directory.
fn shadowed_by_file(entries: &BTreeMap<String, FlatEntry>, path: &str) -> bool {
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if let Some(entry) = entries.get(parent) {
            if !entry.is_dir() {
                return true;
            }
        }
        current = parent;
    }
    false
}

impl Squasher for LayerSquasher {
    fn squash(&self, input: &Path, output: &Path, target: &str) -> Result<(), SquashError> {
        let work = tempfile::TempDir::new()?;
        Archive::new(BufReader::new(File::open(input)?)).unpack(work.path())?;

        let manifest_path = work.path().join("manifest.json");
        if !manifest_path.is_file() {
            return Err(SquashError::MissingEntry("manifest.json".to_string()));
        }
        let manifest: Vec<ManifestEntry> = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        let image = manifest
            .into_iter()
            .next()
            .ok_or_else(|| SquashError::MissingEntry("image entry in manifest.json".to_string()))?;

        let config_path = work.path().join(&image.config);
        if !config_path.is_file() {
            return Err(SquashError::MissingEntry(image.config.clone()));
        }
        let mut config: Value = serde_json::from_slice(&std::fs::read(&config_path)?)?;

        let entries = self.flatten(work.path(), &image.layers)?;
        let layer_file = work.path().join("squashed-layer.tar");
        self.write_layer(&entries, &layer_file)?;
        let layer_digest = sha256_file(&layer_file)?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let object = config
            .as_object_mut()
            .ok_or_else(|| SquashError::MissingEntry("image config object".to_string()))?;
        object.insert(
            "rootfs".to_string(),
            json!({ "type": "layers", "diff_ids": [format!("sha256:{}", layer_digest)] }),
        );
        object.insert(
            "history".to_string(),
            json!([{
                "created": now,
                "created_by": "stepwise squash",
                "comment": format!("squashed {} layers", image.layers.len()),
            }]),
        );
        object.insert("created".to_string(), json!(now));

        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = hex::encode(Sha256::digest(&config_bytes));
        let config_name = format!("{}.json", config_digest);
        let layer_name = format!("{}/layer.tar", layer_digest);

        let out_manifest = vec![ManifestEntry {
            config: config_name.clone(),
            repo_tags: Some(vec![tagged(target)]),
            layers: vec![layer_name.clone()],
        }];
        let manifest_bytes = serde_json::to_vec(&out_manifest)?;

        let mut builder = Builder::new(BufWriter::new(File::create(output)?));
        append_bytes(&mut builder, &config_name, &config_bytes)?;
        append_bytes(&mut builder, &format!("{}/VERSION", layer_digest), b"1.0")?;
        builder.append_path_with_name(&layer_file, &layer_name)?;
        append_bytes(&mut builder, "manifest.json", &manifest_bytes)?;
        builder.into_inner()?.flush()?;

        info!(
            "Squashed {} layers ({} entries) into {} as {}",
            image.layers.len(),
            entries.len(),
            output.display(),
            target
        );
        Ok(())
    }
}

fn append_bytes<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<(), SquashError> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
