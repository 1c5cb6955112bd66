//! Registry credential discovery
//!
//! Reads the legacy `~/.dockercfg` flat map and the `auths` section of
//! `~/.docker/config.json`. Entries from the newer file win.

use crate::config::ConfigError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Loads credentials from the current user's home directory.
///
/// Returns `None` when neither file exists.
pub fn load_credentials() -> Result<Option<HashMap<String, DockerCredentials>>, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::MissingHomeDirectory)?;
    load_credentials_from(&home)
}

pub fn load_credentials_from(
    home: &Path,
) -> Result<Option<HashMap<String, DockerCredentials>>, ConfigError> {
    let legacy = home.join(".dockercfg");
    let current = home.join(".docker").join("config.json");

    let mut found = false;
    let mut credentials = HashMap::new();

    if let Some(content) = read_optional(&legacy)? {
        let entries: HashMap<String, AuthEntry> =
            serde_json::from_str(&content).map_err(|e| credential_error(&legacy, e))?;
        merge(&mut credentials, entries, &legacy)?;
        found = true;
    }

    if let Some(content) = read_optional(&current)? {
        let file: ConfigFile =
            serde_json::from_str(&content).map_err(|e| credential_error(&current, e))?;
        merge(&mut credentials, file.auths, &current)?;
        found = true;
    }

    if !found {
        debug!("No registry credential file found under {}", home.display());
        return Ok(None);
    }

    debug!("Loaded credentials for {} registries", credentials.len());
    Ok(Some(credentials))
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(credential_error(path, e)),
    }
}

fn credential_error(path: &Path, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::CredentialFile {
        path: PathBuf::from(path),
        reason: e.to_string(),
    }
}

fn merge(
    into: &mut HashMap<String, DockerCredentials>,
    entries: HashMap<String, AuthEntry>,
    source: &Path,
) -> Result<(), ConfigError> {
    for (registry, entry) in entries {
        let (mut username, mut password) = (entry.username, entry.password);

        if let Some(encoded) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|e| credential_error(source, format!("{}: {}", registry, e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| credential_error(source, format!("{}: {}", registry, e)))?;
            let (user, pass) = decoded.split_once(':').ok_or_else(|| {
                credential_error(source, format!("{}: auth is not user:password", registry))
            })?;
            username = Some(user.to_string());
            password = Some(pass.to_string());
        }

        into.insert(
            registry.clone(),
            DockerCredentials {
                username,
                password,
                email: entry.email,
                serveraddress: Some(registry),
                identitytoken: entry.identity_token,
                ..Default::default()
            },
        );
    }
    Ok(())
}
