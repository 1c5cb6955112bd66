//! Commit, export, squash and reload of a cleaned-up container

use crate::docker::{DockerApi, ImageRemoval};
use crate::error::{BuildError, SquashError};
use crate::squash::Squasher;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const COMMIT_REPO: &str = "stepwise-squash";

fn temp_archive(prefix: &str) -> Result<NamedTempFile, BuildError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".tar")
        .tempfile()
        .map_err(|e| BuildError::io(std::env::temp_dir(), e))
}

fn close(file: NamedTempFile) -> Result<(), BuildError> {
    let path = file.path().to_path_buf();
    file.close().map_err(|e| BuildError::io(path, e))
}

/// Replaces `target` with a flattened image of `container`.
///
/// The container is stopped along the way. The intermediate commit is
/// removed afterwards on a best-effort basis.
pub async fn squash_container(
    docker: &dyn DockerApi,
    squasher: Arc<dyn Squasher>,
    container: &str,
    target: &str,
    commit_tag: &str,
) -> Result<(), BuildError> {
    let committed = format!("{}:{}", COMMIT_REPO, commit_tag);
    debug!("Committing the container {} as {}", container, committed);
    docker.commit_container(container, COMMIT_REPO, commit_tag).await?;

    debug!("Stopping the container {}", container);
    docker.stop_container(container).await?;

    let exported = temp_archive("stepwise-export-")?;
    info!("Exporting cleaned up container {} to {}", committed, exported.path().display());
    docker.export_image(&committed, exported.path()).await?;

    let squashed = temp_archive("stepwise-squash-")?;
    info!("Squashing image {} into {}", exported.path().display(), squashed.path().display());
    let input: PathBuf = exported.path().to_path_buf();
    let output: PathBuf = squashed.path().to_path_buf();
    let image = target.to_string();
    tokio::task::spawn_blocking(move || squasher.squash(&input, &output, &image))
        .await
        .map_err(|e| SquashError::Worker(e.to_string()))??;

    close(exported)?;

    info!("Loading squashed image into the daemon as {}", target);
    docker.load_image(squashed.path()).await?;
    close(squashed)?;

    if let Err(e) = docker
        .remove_image(&committed, ImageRemoval { force: true, no_prune: false })
        .await
    {
        warn!("Failed to remove intermediate image {}: {}", committed, e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{DaemonCall, MockDaemon};
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSquasher {
        targets: Mutex<Vec<String>>,
    }

    impl Squasher for RecordingSquasher {
        fn squash(&self, input: &Path, output: &Path, target: &str) -> Result<(), SquashError> {
            let data = std::fs::read(input)?;
            std::fs::write(output, [data.as_slice(), target.as_bytes()].concat())?;
            self.targets.lock().unwrap().push(target.to_string());
            Ok(())
        }
    }

    struct FailingSquasher;

    impl Squasher for FailingSquasher {
        fn squash(&self, _input: &Path, _output: &Path, _target: &str) -> Result<(), SquashError> {
            Err(SquashError::MissingEntry("manifest.json".to_string()))
        }
    }

    #[tokio::test]
    async fn test_squash_pipeline_sequence() {
        let daemon = MockDaemon::new().with_image("app").with_export_payload(b"layers|");
        let container = daemon.create_container("app.1", "app").await.unwrap();
        let squasher = Arc::new(RecordingSquasher::default());

        squash_container(&daemon, squasher.clone(), &container, "app-x1", "run1")
            .await
            .unwrap();

        assert_eq!(*squasher.targets.lock().unwrap(), vec!["app-x1".to_string()]);
        assert_eq!(daemon.loaded_archives(), vec![b"layers|app-x1".to_vec()]);
        assert!(!daemon.has_image("stepwise-squash:run1"));

        let calls = daemon.calls();
        let commit = calls.iter().position(|c| matches!(c, DaemonCall::Commit { .. })).unwrap();
        let stop = calls.iter().position(|c| matches!(c, DaemonCall::StopContainer(_))).unwrap();
        let export = calls.iter().position(|c| matches!(c, DaemonCall::Export { .. })).unwrap();
        let load = calls.iter().position(|c| matches!(c, DaemonCall::Load)).unwrap();
        assert!(commit < stop && stop < export && export < load);
    }

    #[tokio::test]
    async fn test_squash_failure_is_fatal() {
        let daemon = MockDaemon::new().with_image("app");
        let container = daemon.create_container("app.1", "app").await.unwrap();

        let err = squash_container(&daemon, Arc::new(FailingSquasher), &container, "app", "t")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Squash(_)));
        assert!(!daemon.calls().contains(&DaemonCall::Load));
    }
}
