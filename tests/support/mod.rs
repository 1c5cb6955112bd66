#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stepwise::error::SquashError;
use stepwise::progress::{BuildEvent, ProgressHandler};
use stepwise::squash::Squasher;
use stepwise::{BuildConfig, CommandExitPolicy, FailurePolicy};
use tempfile::TempDir;

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Copies a fixture into a scratch directory so runs can write next to it.
pub fn workspace(fixture: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    for entry in std::fs::read_dir(fixture_path(fixture)).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), dir.path().join(entry.file_name())).unwrap();
    }
    dir
}

pub fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Settings independent of the caller's environment.
pub fn config(workdir: &Path) -> BuildConfig {
    BuildConfig {
        workdir: workdir.to_path_buf(),
        manifest_path: PathBuf::from("build.yml"),
        unique_id: String::new(),
        keep_artifacts: true,
        keep_steps: true,
        no_squash: false,
        build_args: Vec::new(),
        failure_policy: FailurePolicy::AbortRun,
        command_exit_policy: CommandExitPolicy::Log,
        cancel_siblings_on_failure: false,
        ..BuildConfig::default()
    }
}

/// Writes the input archive followed by the target name.
#[derive(Default)]
pub struct TaggingSquasher {
    pub targets: Mutex<Vec<String>>,
}

impl Squasher for TaggingSquasher {
    fn squash(&self, input: &Path, output: &Path, target: &str) -> Result<(), SquashError> {
        let mut data = std::fs::read(input)?;
        data.extend_from_slice(target.as_bytes());
        std::fs::write(output, data)?;
        self.targets.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<BuildEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressHandler for RecordingHandler {
    fn on_progress(&self, event: &BuildEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
