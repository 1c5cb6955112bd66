//! Runs a single step against the daemon
//!
//! rewrite -> build -> [container: cleanup + squash, artifacts, command,
//! removal] -> delete generated file. The container, once created, is
//! always removed, even when a phase in between failed or the run was
//! cancelled.

use super::artifacts::{extract_archive, parse_mode, stat_command};
use super::squash::squash_container;
use crate::config::{BuildConfig, CommandExitPolicy};
use crate::docker::{BuildRequest, DockerApi};
use crate::dockerfile::rewrite_step;
use crate::error::{ArtifactError, BuildError};
use crate::manifest::{Manifest, Step};
use crate::progress::{BuildEvent, ProgressHandler, StepPhase};
use crate::session::Session;
use crate::squash::Squasher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Wraps a command for `/bin/sh -c` so quoting and pipes work as typed.
pub fn shell_command(command: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Everything a step needs, shared by all steps of a run.
#[derive(Clone)]
pub struct StepExecutor {
    pub(crate) docker: Arc<dyn DockerApi>,
    pub(crate) squasher: Arc<dyn Squasher>,
    pub(crate) progress: Arc<dyn ProgressHandler>,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) config: Arc<BuildConfig>,
    pub(crate) session: Arc<Session>,
    /// Set by a failing sibling when cancellation is enabled
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl StepExecutor {
    pub fn new(
        docker: Arc<dyn DockerApi>,
        squasher: Arc<dyn Squasher>,
        progress: Arc<dyn ProgressHandler>,
        manifest: Arc<Manifest>,
        config: Arc<BuildConfig>,
        session: Arc<Session>,
    ) -> Self {
        Self {
            docker,
            squasher,
            progress,
            manifest,
            config,
            session,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same executor observing a different cancellation flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Builds the step at `index` in the manifest.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for the manifest.
    pub async fn execute(&self, index: usize) -> Result<(), BuildError> {
        let step = &self.manifest.steps[index];
        let image = self.session.unique_step_name(&step.name);
        info!("Building {}", step.name);

        self.enter(step, StepPhase::Rewrite)?;
        let generated = rewrite_step(step, &self.manifest, &self.session, &self.config.workdir)?;

        self.enter(step, StepPhase::BuildImage)?;
        let dockerfile = relative_to(&generated, &self.config.workdir)?;
        info!("Building the {} image from {}", image, dockerfile);
        self.docker
            .build_image(&BuildRequest {
                tag: image.clone(),
                dockerfile,
                context: self.config.workdir.clone(),
                build_args: self.config.build_args_map(),
                no_cache: self.config.no_cache,
                suppress_output: self.config.suppress_output,
                remove_intermediate: self.config.rm_tmp_containers,
                force_remove_intermediate: self.config.force_rm_tmp_container,
            })
            .await?;

        if step.needs_container() {
            self.with_container(step, &image).await?;
        }

        self.emit(step, StepPhase::Finish);
        std::fs::remove_file(&generated).map_err(|e| BuildError::io(&generated, e))?;
        Ok(())
    }

    async fn with_container(&self, step: &Step, image: &str) -> Result<(), BuildError> {
        self.enter(step, StepPhase::CreateContainer)?;
        let name = self.session.container_name(image);
        debug!("Creating container {} from {}", name, image);
        let container = self.docker.create_container(&name, image).await?;

        let outcome = self.run_in_container(step, image, &container).await;

        self.emit(step, StepPhase::RemoveContainer);
        debug!("Removing built container {}", container);
        let removal = self.docker.remove_container(&container).await;

        if let (Err(_), Err(e)) = (&outcome, &removal) {
            warn!("Failed to remove container {} of failed step {}: {}", container, step.name, e);
        }
        outcome?;
        removal?;
        Ok(())
    }

    async fn run_in_container(&self, step: &Step, image: &str, container: &str) -> Result<(), BuildError> {
        if !self.config.no_squash && !step.cleanup.is_empty() {
            self.enter(step, StepPhase::Cleanup)?;
            self.run_cleanup(step, container).await?;

            self.enter(step, StepPhase::Squash)?;
            let commit_tag = format!("{}-{}", self.session.builder_id, short_id(container));
            squash_container(
                self.docker.as_ref(),
                self.squasher.clone(),
                container,
                image,
                &commit_tag,
            )
            .await?;
        }

        if !step.artifacts.is_empty() {
            self.enter(step, StepPhase::FetchArtifacts)?;
            self.fetch_artifacts(step, container).await?;
        }

        if let Some(command) = &step.command {
            self.enter(step, StepPhase::RunCommand)?;
            self.run_command(command, container).await?;
        }

        Ok(())
    }

    async fn run_cleanup(&self, step: &Step, container: &str) -> Result<(), BuildError> {
        info!("Starting container {} to run cleanup commands", container);
        self.docker.start_container(container).await?;

        for command in &step.cleanup {
            debug!("Running cleanup command {} on {}", command, container);
            let exec = self
                .docker
                .create_exec(container, &shell_command(command), false)
                .await?;
            if let Err(e) = self.docker.start_exec(&exec, false).await {
                error!("Failed to execute cleanup command '{}': {}", command, e);
            }
        }
        Ok(())
    }

    async fn fetch_artifacts(&self, step: &Step, container: &str) -> Result<(), BuildError> {
        info!("Starting container {} to fetch artifact permissions", container);
        self.docker.start_container(container).await?;

        let mut modes: HashMap<&str, u32> = HashMap::new();
        for artifact in &step.artifacts {
            let exec = self
                .docker
                .create_exec(container, &stat_command(&artifact.source), false)
                .await?;
            match self.docker.start_exec(&exec, false).await {
                Ok(output) => match parse_mode(&output) {
                    Some(mode) => {
                        debug!("Permissions for {}: {:o}", artifact.source, mode);
                        modes.insert(artifact.source.as_str(), mode);
                    }
                    None => error!(
                        "Failed to parse permissions for {}: {}",
                        artifact.source,
                        output.trim()
                    ),
                },
                Err(e) => error!("Failed to fetch permissions for {}: {}", artifact.source, e),
            }
        }

        debug!("Stopping the container {}", container);
        self.docker.stop_container(container).await?;

        info!("Copying artifacts from {}", container);
        for artifact in &step.artifacts {
            let archive = self
                .docker
                .download_from_container(container, &artifact.source)
                .await?;
            let mode = modes.get(artifact.source.as_str()).copied();
            let artifact = artifact.clone();
            let workdir = self.config.workdir.clone();
            let target = workdir.join(&artifact.dest);
            tokio::task::spawn_blocking(move || extract_archive(&archive, &artifact, &workdir, mode))
                .await
                .map_err(|e| ArtifactError::Io {
                    path: target,
                    source: std::io::Error::other(e),
                })??;
        }
        Ok(())
    }

    async fn run_command(&self, command: &str, container: &str) -> Result<(), BuildError> {
        info!("Starting container {} to run commands", container);
        self.docker.start_container(container).await?;

        let exec = self
            .docker
            .create_exec(container, &shell_command(command), true)
            .await?;
        info!("Running command {} on container {}", command, container);
        match self.docker.start_exec(&exec, true).await {
            Ok(output) if !output.is_empty() => info!("\n{}", output),
            Ok(_) => {}
            Err(e) => warn!("Failed to run command {} on container {}: {}", command, container, e),
        }

        let exit_code = self.docker.inspect_exec(&exec).await?.unwrap_or(0);
        let failed = exit_code != 0;
        if failed {
            error!(
                "Running command {} on container {} exit with exit code {}",
                command, container, exit_code
            );
        } else {
            info!("Running command {} on container {} exit with exit code 0", command, container);
        }

        debug!("Stopping the container {}", container);
        self.docker.stop_container(container).await?;

        if failed && self.config.command_exit_policy == CommandExitPolicy::Fail {
            return Err(BuildError::CommandFailed {
                command: command.to_string(),
                exit_code,
            });
        }
        Ok(())
    }

    fn enter(&self, step: &Step, phase: StepPhase) -> Result<(), BuildError> {
        if self.cancelled.load(Ordering::SeqCst) {
            warn!("Step {} cancelled before {}", step.name, phase);
            return Err(BuildError::Cancelled);
        }
        self.emit(step, phase);
        Ok(())
    }

    fn emit(&self, step: &Step, phase: StepPhase) {
        self.progress.on_progress(&BuildEvent::PhaseStarted {
            step: step.name.clone(),
            phase,
        });
    }
}

fn short_id(container: &str) -> &str {
    container.get(..12).unwrap_or(container)
}

fn relative_to(path: &Path, base: &Path) -> Result<String, BuildError> {
    path.strip_prefix(base)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|_| BuildError::InvalidBuildFile {
            path: PathBuf::from(path),
            reason: format!("build file is outside of {}", base.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{DaemonCall, MockDaemon};
    use crate::manifest::Artifact;
    use crate::progress::NoOpHandler;
    use crate::squash::LayerSquasher;
    use tempfile::TempDir;

    fn workdir(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn executor(dir: &TempDir, manifest: Manifest, daemon: Arc<MockDaemon>, config: BuildConfig) -> StepExecutor {
        let config = BuildConfig {
            workdir: dir.path().to_path_buf(),
            ..config
        };
        StepExecutor::new(
            daemon,
            Arc::new(LayerSquasher),
            Arc::new(NoOpHandler),
            Arc::new(manifest),
            Arc::new(config),
            Arc::new(Session::new("")),
        )
    }

    fn test_config() -> BuildConfig {
        BuildConfig {
            no_squash: true,
            ..BuildConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_only_step_skips_container() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new());
        let manifest = Manifest::new(vec![Step::new("base", "Dockerfile")]);
        let exec = executor(&dir, manifest, daemon.clone(), test_config());

        exec.execute(0).await.unwrap();

        assert_eq!(
            daemon.calls(),
            vec![DaemonCall::Build {
                tag: "base".to_string(),
                dockerfile: "Dockerfile.generated".to_string()
            }]
        );
        assert!(!dir.path().join("Dockerfile.generated").exists());
    }

    #[tokio::test]
    async fn test_artifacts_are_copied_and_container_removed() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new().with_file("/app/server", b"bin", 0o755));
        let manifest = Manifest::new(vec![
            Step::new("app", "Dockerfile").with_artifact(Artifact::new("/app/server", "out"))
        ]);
        let exec = executor(&dir, manifest, daemon.clone(), test_config());

        exec.execute(0).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("out/server")).unwrap(), b"bin");
        assert_eq!(daemon.live_containers(), 0);

        let calls = daemon.calls();
        let stop = calls.iter().position(|c| matches!(c, DaemonCall::StopContainer(_))).unwrap();
        let download = calls.iter().position(|c| matches!(c, DaemonCall::Download { .. })).unwrap();
        assert!(stop < download);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_but_removes_container() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new());
        let manifest = Manifest::new(vec![
            Step::new("app", "Dockerfile").with_artifact(Artifact::new("/nope", "out"))
        ]);
        let exec = executor(&dir, manifest, daemon.clone(), test_config());

        assert!(exec.execute(0).await.is_err());
        assert_eq!(daemon.live_containers(), 0);
        assert!(dir.path().join("Dockerfile.generated").exists());
    }

    #[tokio::test]
    async fn test_command_exit_policy() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let manifest = Manifest::new(vec![Step::new("app", "Dockerfile").with_command("make test")]);

        let daemon = Arc::new(MockDaemon::new().with_exit_code("make test", 2));
        let exec = executor(&dir, manifest.clone(), daemon.clone(), test_config());
        exec.execute(0).await.unwrap();
        assert_eq!(daemon.exec_commands(), vec!["make test".to_string()]);

        let daemon = Arc::new(MockDaemon::new().with_exit_code("make test", 2));
        let config = BuildConfig {
            command_exit_policy: CommandExitPolicy::Fail,
            ..test_config()
        };
        let exec = executor(&dir, manifest, daemon.clone(), config);
        let err = exec.execute(0).await.unwrap_err();
        assert!(matches!(err, BuildError::CommandFailed { exit_code: 2, .. }));
        assert_eq!(daemon.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_ignored_when_squash_disabled() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new());
        let manifest = Manifest::new(vec![Step::new("app", "Dockerfile").with_cleanup("rm -rf /tmp/*")]);
        let exec = executor(&dir, manifest, daemon.clone(), test_config());

        exec.execute(0).await.unwrap();

        assert!(daemon.exec_commands().is_empty());
        assert!(!daemon.calls().iter().any(|c| matches!(c, DaemonCall::Commit { .. })));
        assert_eq!(daemon.live_containers(), 0);
    }

    struct CopySquasher;

    impl Squasher for CopySquasher {
        fn squash(&self, input: &Path, output: &Path, _target: &str) -> Result<(), crate::error::SquashError> {
            std::fs::copy(input, output)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cleanup_start_failure_is_not_fatal() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new().fail_exec("rm -rf /tmp/*"));
        let manifest = Manifest::new(vec![Step::new("app", "Dockerfile")
            .with_cleanup("rm -rf /tmp/*")
            .with_cleanup("apt-get clean")]);
        let config = BuildConfig {
            no_squash: false,
            ..test_config()
        };
        let mut exec = executor(&dir, manifest, daemon.clone(), config);
        exec.squasher = Arc::new(CopySquasher);

        exec.execute(0).await.unwrap();

        assert_eq!(
            daemon.exec_commands(),
            vec!["rm -rf /tmp/*".to_string(), "apt-get clean".to_string()]
        );
        assert_eq!(daemon.loaded_archives().len(), 1);
        assert_eq!(daemon.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new());
        let manifest = Manifest::new(vec![Step::new("app", "Dockerfile")]);
        let flag = Arc::new(AtomicBool::new(true));
        let exec = executor(&dir, manifest, daemon.clone(), test_config()).with_cancel_flag(flag);

        assert!(matches!(exec.execute(0).await, Err(BuildError::Cancelled)));
        assert!(daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_command_start_failure_left_to_exit_policy() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new().fail_exec("make test"));
        let manifest = Manifest::new(vec![Step::new("app", "Dockerfile").with_command("make test")]);
        let config = BuildConfig {
            command_exit_policy: CommandExitPolicy::Fail,
            ..test_config()
        };
        let exec = executor(&dir, manifest, daemon.clone(), config);

        exec.execute(0).await.unwrap();

        let calls = daemon.calls();
        assert!(calls.iter().any(|c| matches!(c, DaemonCall::InspectExec(_))));
        assert!(calls.iter().any(|c| matches!(c, DaemonCall::StopContainer(_))));
        assert_eq!(daemon.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_container_removal_failure_fails_step() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(
            MockDaemon::new()
                .with_file("/app/server", b"bin", 0o755)
                .fail_container_removal(),
        );
        let manifest = Manifest::new(vec![
            Step::new("app", "Dockerfile").with_artifact(Artifact::new("/app/server", "out"))
        ]);
        let exec = executor(&dir, manifest, daemon.clone(), test_config());

        let err = exec.execute(0).await.unwrap_err();

        assert!(matches!(err, BuildError::Daemon(_)));
        assert!(err.to_string().contains("removal of container"));
        assert!(dir.path().join("out/server").exists());
    }

    #[tokio::test]
    async fn test_step_error_wins_over_removal_error() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(
            MockDaemon::new()
                .with_exit_code("make test", 3)
                .fail_container_removal(),
        );
        let manifest = Manifest::new(vec![Step::new("app", "Dockerfile").with_command("make test")]);
        let config = BuildConfig {
            command_exit_policy: CommandExitPolicy::Fail,
            ..test_config()
        };
        let exec = executor(&dir, manifest, daemon.clone(), config);

        let err = exec.execute(0).await.unwrap_err();

        assert!(matches!(err, BuildError::CommandFailed { exit_code: 3, .. }));
        assert!(daemon
            .calls()
            .iter()
            .any(|c| matches!(c, DaemonCall::RemoveContainer(_))));
    }

    #[tokio::test]
    async fn test_directory_artifact_rejected() {
        let dir = workdir(&[("Dockerfile", "FROM alpine\n")]);
        let daemon = Arc::new(MockDaemon::new().with_directory("/app/bin"));
        let manifest = Manifest::new(vec![
            Step::new("app", "Dockerfile").with_artifact(Artifact::new("/app/bin", "out"))
        ]);
        let exec = executor(&dir, manifest, daemon.clone(), test_config());

        let err = exec.execute(0).await.unwrap_err();

        assert!(matches!(
            err,
            BuildError::Artifact(ArtifactError::UnsupportedEntry { .. })
        ));
        assert_eq!(daemon.live_containers(), 0);
    }

    #[test]
    fn test_shell_command() {
        assert_eq!(shell_command("echo 'a b' | wc"), vec!["/bin/sh", "-c", "echo 'a b' | wc"]);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("c-1"), "c-1");
    }
}
