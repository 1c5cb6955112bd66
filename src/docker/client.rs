use super::api::{BuildRequest, DockerApi, ImageRemoval};
use crate::error::DaemonError;
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CommitContainerOptions, ImportImageOptions, RemoveImageOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const DEFAULT_SHELL: &str = "/bin/bash";

/// [`DockerApi`] backed by a bollard client.
#[derive(Clone)]
pub struct BollardDaemon {
    docker: Docker,
    credentials: Option<HashMap<String, DockerCredentials>>,
}

impl BollardDaemon {
    pub fn new(docker: Docker, credentials: Option<HashMap<String, DockerCredentials>>) -> Self {
        Self { docker, credentials }
    }
}

const DOCKERIGNORE: &str = ".dockerignore";

/// Patterns from `<dir>/.dockerignore`, anchored at the context root.
fn dockerignore(dir: &Path) -> io::Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(dir);
    match std::fs::read_to_string(dir.join(DOCKERIGNORE)) {
        Ok(content) => {
            for line in content.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (negate, pattern) = match line.strip_prefix('!') {
                    Some(rest) => ("!", rest.trim()),
                    None => ("", line),
                };
                let pattern = pattern.trim_start_matches("./").trim_start_matches('/');
                if pattern.is_empty() {
                    continue;
                }
                builder
                    .add_line(None, &format!("{}/{}", negate, pattern))
                    .map_err(io::Error::other)?;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    builder.build().map_err(io::Error::other)
}

/// Packs a directory into an in-memory tar used as the build context.
///
/// Entries matched by `.dockerignore` are left out. The build file and the
/// `.dockerignore` itself are always sent.
pub fn pack_context(dir: &Path, dockerfile: &str) -> io::Result<Vec<u8>> {
    let ignored = dockerignore(dir)?;
    let always = [PathBuf::from(dockerfile), PathBuf::from(DOCKERIGNORE)];
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let filter = ignored.clone();
    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            !is_dir || entry.depth() == 0 || !filter.matched(entry.path(), true).is_ignore()
        })
        .build();

    let mut sent = 0usize;
    let mut packed = Vec::new();
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir
            && !always.iter().any(|p| p == relative)
            && ignored.matched(entry.path(), false).is_ignore()
        {
            debug!("Leaving {} out of the build context", relative.display());
            continue;
        }

        if is_dir {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
        packed.push(relative.to_path_buf());
        sent += 1;
    }

    // the build file must reach the daemon even when its directory is ignored
    for required in &always {
        let source = dir.join(required);
        if source.is_file() && !packed.contains(required) {
            builder.append_path_with_name(&source, required)?;
            sent += 1;
        }
    }

    debug!("Packed {} context entries from {}", sent, dir.display());
    builder.into_inner()
}

fn worker_error(e: tokio::task::JoinError) -> DaemonError {
    DaemonError::Other(format!("context packing task failed: {}", e))
}

#[async_trait]
impl DockerApi for BollardDaemon {
    async fn build_image(&self, request: &BuildRequest) -> Result<(), DaemonError> {
        let context_dir: PathBuf = request.context.clone();
        let dockerfile = request.dockerfile.clone();
        let context = tokio::task::spawn_blocking(move || pack_context(&context_dir, &dockerfile))
            .await
            .map_err(worker_error)??;
        debug!("Build context for {} is {} bytes", request.tag, context.len());

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.tag.clone(),
            q: request.suppress_output,
            nocache: request.no_cache,
            rm: request.remove_intermediate,
            forcerm: request.force_remove_intermediate,
            buildargs: request.build_args.clone(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, self.credentials.clone(), Some(Bytes::from(context)));

        while let Some(item) = stream.next().await {
            let info = item?;
            if let Some(error) = info.error {
                return Err(DaemonError::BuildFailed(error));
            }
            if request.suppress_output {
                continue;
            }
            if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                if !line.is_empty() {
                    info!(image = %request.tag, "{}", line);
                }
            }
        }

        Ok(())
    }

    async fn create_container(&self, name: &str, image: &str) -> Result<String, DaemonError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![DEFAULT_SHELL.to_string()]),
            tty: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!(container = name, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DaemonError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), DaemonError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 0 }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), DaemonError> {
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn create_exec(&self, container: &str, cmd: &[String], tty: bool) -> Result<String, DaemonError> {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container, options).await?;
        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<String, DaemonError> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(exec_id, Some(options)).await?
        {
            while let Some(chunk) = output.next().await {
                let text = String::from_utf8_lossy(&chunk?.into_bytes()).into_owned();
                debug!(exec = exec_id, "{}", text.trim_end());
                collected.push_str(&text);
            }
        }
        Ok(collected)
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, DaemonError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code)
    }

    async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> Result<(), DaemonError> {
        let options = CommitContainerOptions {
            container: container.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await?;
        Ok(())
    }

    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), DaemonError> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = self.docker.export_image(image);
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!("Exported {} ({} bytes) to {}", image, written, dest.display());
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> Result<(), DaemonError> {
        let data = tokio::fs::read(archive).await?;
        let mut stream = self.docker.import_image(
            ImportImageOptions { quiet: true },
            Bytes::from(data),
            self.credentials.clone(),
        );
        while let Some(item) = stream.next().await {
            let info = item?;
            if let Some(error) = info.error {
                return Err(DaemonError::LoadFailed(error));
            }
            if let Some(line) = info.stream.as_deref().map(str::trim_end) {
                debug!("{}", line);
            }
        }
        Ok(())
    }

    async fn download_from_container(&self, container: &str, path: &str) -> Result<Vec<u8>, DaemonError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive)
    }

    async fn remove_image(&self, image: &str, options: ImageRemoval) -> Result<(), DaemonError> {
        let options = RemoveImageOptions {
            force: options.force,
            noprune: options.no_prune,
        };
        self.docker.remove_image(image, Some(options), None).await?;
        Ok(())
    }
}
