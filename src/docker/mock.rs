//! In-memory daemon for tests
//!
//! Records every call in order and keeps just enough state (images,
//! containers, execs) to reject calls a real daemon would reject.

use super::api::{BuildRequest, DockerApi, ImageRemoval};
use crate::error::DaemonError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCall {
    Build { tag: String, dockerfile: String },
    CreateContainer { name: String, image: String },
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    CreateExec { container: String, cmd: Vec<String> },
    StartExec(String),
    InspectExec(String),
    Commit { container: String, reference: String },
    Export { image: String },
    Load,
    Download { container: String, path: String },
    RemoveImage { image: String, force: bool, no_prune: bool },
}

#[derive(Debug, Clone)]
struct MockFile {
    content: Vec<u8>,
    mode: u32,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<DaemonCall>,
    images: BTreeSet<String>,
    containers: HashMap<String, String>,
    execs: HashMap<String, Vec<String>>,
    next_id: usize,
    loaded: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct MockDaemon {
    state: Mutex<State>,
    files: HashMap<String, MockFile>,
    directories: HashSet<String>,
    failing_builds: HashSet<String>,
    failing_execs: HashSet<String>,
    exit_codes: HashMap<String, i64>,
    build_delays: HashMap<String, Duration>,
    export_payload: Vec<u8>,
    fail_container_removal: bool,
}

/// Key a command is matched by: the script of `sh -c`, else the joined argv.
fn command_key(cmd: &[String]) -> String {
    match cmd {
        [shell, flag, script] if shell.ends_with("sh") && flag == "-c" => script.clone(),
        _ => cmd.join(" "),
    }
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// A regular file visible to `stat` and downloads in every container.
    pub fn with_file(mut self, path: &str, content: &[u8], mode: u32) -> Self {
        self.files.insert(
            path.to_string(),
            MockFile {
                content: content.to_vec(),
                mode,
            },
        );
        self
    }

    /// A path that downloads as a directory entry.
    pub fn with_directory(mut self, path: &str) -> Self {
        self.directories.insert(path.to_string());
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.lock().images.insert(image.to_string());
        self
    }

    pub fn fail_build(mut self, tag: &str) -> Self {
        self.failing_builds.insert(tag.to_string());
        self
    }

    /// Makes starting an exec of `command` fail.
    pub fn fail_exec(mut self, command: &str) -> Self {
        self.failing_execs.insert(command.to_string());
        self
    }

    pub fn with_exit_code(mut self, command: &str, code: i64) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    pub fn with_build_delay(mut self, tag: &str, delay: Duration) -> Self {
        self.build_delays.insert(tag.to_string(), delay);
        self
    }

    pub fn with_export_payload(mut self, payload: &[u8]) -> Self {
        self.export_payload = payload.to_vec();
        self
    }

    pub fn fail_container_removal(mut self) -> Self {
        self.fail_container_removal = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: DaemonCall) {
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<DaemonCall> {
        self.lock().calls.clone()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DaemonCall::Build { tag, .. } => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DaemonCall::RemoveImage { image, .. } => Some(image),
                _ => None,
            })
            .collect()
    }

    /// Commands executed in containers, keyed the same way as `fail_exec`.
    pub fn exec_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DaemonCall::CreateExec { cmd, .. } => Some(command_key(&cmd)),
                _ => None,
            })
            .collect()
    }

    pub fn loaded_archives(&self) -> Vec<Vec<u8>> {
        self.lock().loaded.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.lock().containers.len()
    }

    fn exec_command(&self, exec_id: &str) -> Result<Vec<String>, DaemonError> {
        self.lock()
            .execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| DaemonError::Other(format!("No such exec instance: {}", exec_id)))
    }

    fn require_container(&self, id: &str) -> Result<(), DaemonError> {
        if self.lock().containers.contains_key(id) {
            Ok(())
        } else {
            Err(DaemonError::Other(format!("No such container: {}", id)))
        }
    }

    fn file_archive(&self, path: &str) -> Result<Vec<u8>, DaemonError> {
        let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
        let mut builder = tar::Builder::new(Vec::new());

        if let Some(file) = self.files.get(path) {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(file.content.len() as u64);
            header.set_mode(file.mode);
            header.set_cksum();
            builder.append_data(&mut header, name, file.content.as_slice())?;
        } else if self.directories.contains(path) {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
        } else {
            return Err(DaemonError::Other(format!("Could not find the file {} in container", path)));
        }

        Ok(builder.into_inner()?)
    }
}

#[async_trait]
impl DockerApi for MockDaemon {
    async fn build_image(&self, request: &BuildRequest) -> Result<(), DaemonError> {
        self.record(DaemonCall::Build {
            tag: request.tag.clone(),
            dockerfile: request.dockerfile.clone(),
        });

        if let Some(delay) = self.build_delays.get(&request.tag) {
            tokio::time::sleep(*delay).await;
        }

        if !request.context.join(&request.dockerfile).is_file() {
            return Err(DaemonError::BuildFailed(format!(
                "Cannot locate specified Dockerfile: {}",
                request.dockerfile
            )));
        }
        if self.failing_builds.contains(&request.tag) {
            return Err(DaemonError::BuildFailed(format!("build of {} failed", request.tag)));
        }

        self.lock().images.insert(request.tag.clone());
        Ok(())
    }

    async fn create_container(&self, name: &str, image: &str) -> Result<String, DaemonError> {
        self.record(DaemonCall::CreateContainer {
            name: name.to_string(),
            image: image.to_string(),
        });

        let mut state = self.lock();
        if !state.images.contains(image) {
            return Err(DaemonError::Other(format!("No such image: {}", image)));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(id.clone(), image.to_string());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DaemonError> {
        self.record(DaemonCall::StartContainer(id.to_string()));
        self.require_container(id)
    }

    async fn stop_container(&self, id: &str) -> Result<(), DaemonError> {
        self.record(DaemonCall::StopContainer(id.to_string()));
        self.require_container(id)
    }

    async fn remove_container(&self, id: &str) -> Result<(), DaemonError> {
        self.record(DaemonCall::RemoveContainer(id.to_string()));
        if self.fail_container_removal {
            return Err(DaemonError::Other(format!("removal of container {} failed", id)));
        }
        self.lock()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DaemonError::Other(format!("No such container: {}", id)))
    }

    async fn create_exec(&self, container: &str, cmd: &[String], _tty: bool) -> Result<String, DaemonError> {
        self.record(DaemonCall::CreateExec {
            container: container.to_string(),
            cmd: cmd.to_vec(),
        });
        self.require_container(container)?;

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("exec-{}", state.next_id);
        state.execs.insert(id.clone(), cmd.to_vec());
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, _tty: bool) -> Result<String, DaemonError> {
        self.record(DaemonCall::StartExec(exec_id.to_string()));
        let cmd = self.exec_command(exec_id)?;
        let key = command_key(&cmd);

        if self.failing_execs.contains(&key) {
            return Err(DaemonError::Other(format!("exec of '{}' failed to start", key)));
        }

        if cmd.first().map(String::as_str) == Some("stat") {
            let target = cmd.last().map(String::as_str).unwrap_or_default();
            return Ok(match self.files.get(target) {
                Some(file) => format!("{:o}\n", file.mode),
                None => format!("stat: cannot stat '{}': No such file or directory\n", target),
            });
        }

        Ok(String::new())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, DaemonError> {
        self.record(DaemonCall::InspectExec(exec_id.to_string()));
        let cmd = self.exec_command(exec_id)?;
        Ok(Some(self.exit_codes.get(&command_key(&cmd)).copied().unwrap_or(0)))
    }

    async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> Result<(), DaemonError> {
        let reference = format!("{}:{}", repo, tag);
        self.record(DaemonCall::Commit {
            container: container.to_string(),
            reference: reference.clone(),
        });
        self.require_container(container)?;
        self.lock().images.insert(reference);
        Ok(())
    }

    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), DaemonError> {
        self.record(DaemonCall::Export {
            image: image.to_string(),
        });
        if !self.has_image(image) {
            return Err(DaemonError::Other(format!("No such image: {}", image)));
        }
        tokio::fs::write(dest, &self.export_payload).await?;
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> Result<(), DaemonError> {
        self.record(DaemonCall::Load);
        let data = tokio::fs::read(archive).await?;
        self.lock().loaded.push(data);
        Ok(())
    }

    async fn download_from_container(&self, container: &str, path: &str) -> Result<Vec<u8>, DaemonError> {
        self.record(DaemonCall::Download {
            container: container.to_string(),
            path: path.to_string(),
        });
        self.require_container(container)?;
        self.file_archive(path)
    }

    async fn remove_image(&self, image: &str, options: ImageRemoval) -> Result<(), DaemonError> {
        self.record(DaemonCall::RemoveImage {
            image: image.to_string(),
            force: options.force,
            no_prune: options.no_prune,
        });
        if self.lock().images.remove(image) {
            Ok(())
        } else {
            Err(DaemonError::Other(format!("No such image: {}", image)))
        }
    }
}
