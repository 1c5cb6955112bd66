use crate::config::{BuildConfig, ConfigError};
use crate::error::DaemonError;
use bollard::{Docker, API_DEFAULT_VERSION};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEndpoint {
    Unix(String),
    /// `host:port`; `tls` is forced by an `https://` scheme
    Tcp { addr: String, tls: bool },
}

impl DaemonEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpoint(endpoint.to_string());

        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(DaemonEndpoint::Unix(path.to_string()));
        }

        let (addr, tls) = if let Some(rest) = endpoint.strip_prefix("tcp://") {
            (rest, false)
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            (rest, false)
        } else if let Some(rest) = endpoint.strip_prefix("https://") {
            (rest, true)
        } else {
            return Err(invalid());
        };

        let addr = addr.trim_end_matches('/');
        if addr.is_empty() {
            return Err(invalid());
        }
        Ok(DaemonEndpoint::Tcp {
            addr: addr.to_string(),
            tls,
        })
    }
}

/// Paths of the mutual-TLS material under a certificate directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsMaterial {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            ca: dir.join("ca.pem"),
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
        }
    }

    fn check(&self) -> Result<(), DaemonError> {
        for path in [&self.ca, &self.cert, &self.key] {
            if !path.is_file() {
                return Err(DaemonError::InvalidEndpoint {
                    endpoint: path.display().to_string(),
                    reason: "TLS material not found".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Opens a client for the configured daemon.
pub fn connect(config: &BuildConfig) -> Result<Docker, DaemonError> {
    let endpoint = DaemonEndpoint::parse(&config.docker_host).map_err(|e| {
        DaemonError::InvalidEndpoint {
            endpoint: config.docker_host.clone(),
            reason: e.to_string(),
        }
    })?;

    let docker = match endpoint {
        DaemonEndpoint::Unix(path) => {
            debug!("Connecting to Unix socket: {}", path);
            Docker::connect_with_unix(&path, DEFAULT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        }
        DaemonEndpoint::Tcp { addr, tls } if tls || config.use_tls => {
            let cert_dir = config.docker_cert_path.as_deref().ok_or_else(|| {
                DaemonError::InvalidEndpoint {
                    endpoint: config.docker_host.clone(),
                    reason: "TLS requested but no certificate path configured".to_string(),
                }
            })?;
            let material = TlsMaterial::from_dir(cert_dir);
            material.check()?;
            debug!("Connecting to {} with TLS material from {}", addr, cert_dir.display());
            Docker::connect_with_ssl(
                &addr,
                &material.key,
                &material.cert,
                &material.ca,
                DEFAULT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?
        }
        DaemonEndpoint::Tcp { addr, .. } => {
            debug!("Connecting to TCP: {}", addr);
            Docker::connect_with_http(&format!("http://{}", addr), DEFAULT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        }
    };

    info!("Using build daemon at {}", config.docker_host);
    Ok(docker)
}
