use super::artifacts::{collect_artifact_roots, remove_artifact_roots};
use super::executor::StepExecutor;
use super::report::{RunReport, StepOutcome, StepReport};
use crate::config::{BuildConfig, FailurePolicy};
use crate::docker::{DockerApi, ImageRemoval};
use crate::error::ScheduleError;
use crate::manifest::Manifest;
use crate::progress::{BuildEvent, LoggingHandler, ProgressHandler};
use crate::scheduler::{schedule, Schedule};
use crate::session::Session;
use crate::squash::{LayerSquasher, Squasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Runs a manifest level by level.
///
/// Steps of one level run concurrently; a level starts only after every
/// step of the previous level finished.
pub struct Builder {
    manifest: Arc<Manifest>,
    config: Arc<BuildConfig>,
    session: Arc<Session>,
    docker: Arc<dyn DockerApi>,
    squasher: Arc<dyn Squasher>,
    progress: Arc<dyn ProgressHandler>,
}

impl Builder {
    pub fn new(manifest: Manifest, config: BuildConfig, docker: Arc<dyn DockerApi>) -> Self {
        let session = Session::new(config.unique_id.clone());
        Self {
            manifest: Arc::new(manifest),
            config: Arc::new(config),
            session: Arc::new(session),
            docker,
            squasher: Arc::new(LayerSquasher),
            progress: Arc::new(LoggingHandler),
        }
    }

    pub fn with_squasher(mut self, squasher: Arc<dyn Squasher>) -> Self {
        self.squasher = squasher;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Builds every step. Scheduling problems abort before anything runs;
    /// step failures end up in the report.
    pub async fn run(&self) -> Result<RunReport, ScheduleError> {
        let start = Instant::now();
        let schedule = schedule(&self.manifest, &self.config.workdir)?;
        info!(
            "Scheduled {} step(s) in {} level(s)",
            self.manifest.len(),
            schedule.len()
        );

        let roots = if self.config.keep_artifacts {
            Vec::new()
        } else {
            collect_artifact_roots(&self.manifest, &self.config.workdir)
        };

        self.progress.on_progress(&BuildEvent::RunStarted {
            steps: self.manifest.len(),
            levels: schedule.len(),
        });

        let mut reports: Vec<Option<StepReport>> = vec![None; self.manifest.len()];
        let mut aborted = false;

        for (level, steps) in schedule.levels.iter().enumerate() {
            let mut runnable = Vec::new();
            for &index in steps {
                let blocked_by = if aborted {
                    self.failed_names(&reports)
                } else {
                    self.blocked_by(&schedule, &reports, index)
                };
                if blocked_by.is_empty() {
                    runnable.push(index);
                } else {
                    reports[index] = Some(self.skip(index, level, blocked_by));
                }
            }

            if runnable.is_empty() {
                continue;
            }

            let failures = self.run_level(level, &runnable, &mut reports).await;
            if failures > 0 && self.config.failure_policy == FailurePolicy::AbortRun {
                error!("Level {} had {} failure(s), aborting the run", level, failures);
                aborted = true;
            }
        }

        if !self.config.keep_artifacts {
            remove_artifact_roots(&roots);
        }

        let outcomes: Vec<StepReport> = reports.into_iter().flatten().collect();
        if !self.config.keep_steps {
            self.remove_step_images(&outcomes).await;
        }

        let report = RunReport {
            outcomes,
            total_time: start.elapsed(),
        };
        self.progress.on_progress(&BuildEvent::RunCompleted {
            succeeded: report.succeeded_steps().len(),
            failed: report.failed_steps().len(),
            skipped: report.skipped_steps().len(),
            total_time: report.total_time,
        });
        Ok(report)
    }

    async fn run_level(
        &self,
        level: usize,
        runnable: &[usize],
        reports: &mut [Option<StepReport>],
    ) -> usize {
        self.progress.on_progress(&BuildEvent::LevelStarted {
            level,
            steps: runnable
                .iter()
                .map(|&i| self.manifest.steps[i].name.clone())
                .collect(),
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_siblings = self.config.cancel_siblings_on_failure;
        let mut handles = Vec::with_capacity(runnable.len());

        for &index in runnable {
            let step = &self.manifest.steps[index];
            self.progress.on_progress(&BuildEvent::StepStarted {
                step: step.name.clone(),
                image: self.session.unique_step_name(&step.name),
            });

            let executor = self.executor().with_cancel_flag(cancel.clone());
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let result = executor.execute(index).await;
                if result.is_err() && cancel_siblings {
                    cancel.store(true, Ordering::SeqCst);
                }
                (result, started.elapsed())
            });
            handles.push((index, handle));
        }

        let mut failures = 0;
        for (index, handle) in handles {
            let (result, duration) = match handle.await {
                Ok((result, duration)) => (result.map_err(|e| e.to_string()), duration),
                Err(e) => (Err(format!("step task failed: {}", e)), Duration::ZERO),
            };

            let step = &self.manifest.steps[index];
            let outcome = match result {
                Ok(()) => {
                    info!("Step {} built in {:.1}s", step.name, duration.as_secs_f64());
                    self.progress.on_progress(&BuildEvent::StepCompleted {
                        step: step.name.clone(),
                        duration,
                    });
                    StepOutcome::Succeeded
                }
                Err(e) => {
                    failures += 1;
                    error!("Step {} failed: {}", step.name, e);
                    self.progress.on_progress(&BuildEvent::StepFailed {
                        step: step.name.clone(),
                        error: e.clone(),
                    });
                    StepOutcome::Failed(e)
                }
            };

            reports[index] = Some(StepReport {
                step: step.name.clone(),
                image: self.session.unique_step_name(&step.name),
                level,
                outcome,
                duration,
            });
        }

        self.progress
            .on_progress(&BuildEvent::LevelCompleted { level, failures });
        failures
    }

    fn executor(&self) -> StepExecutor {
        StepExecutor::new(
            self.docker.clone(),
            self.squasher.clone(),
            self.progress.clone(),
            self.manifest.clone(),
            self.config.clone(),
            self.session.clone(),
        )
    }

    /// Dependencies of `index` that did not succeed.
    fn blocked_by(&self, schedule: &Schedule, reports: &[Option<StepReport>], index: usize) -> Vec<String> {
        schedule.dependencies[index]
            .iter()
            .filter(|&&dep| {
                !reports[dep]
                    .as_ref()
                    .is_some_and(|r| r.outcome.is_success())
            })
            .map(|&dep| self.manifest.steps[dep].name.clone())
            .collect()
    }

    fn failed_names(&self, reports: &[Option<StepReport>]) -> Vec<String> {
        reports
            .iter()
            .flatten()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
            .map(|r| r.step.clone())
            .collect()
    }

    fn skip(&self, index: usize, level: usize, blocked_by: Vec<String>) -> StepReport {
        let step = &self.manifest.steps[index];
        warn!("Skipping {}: blocked by {}", step.name, blocked_by.join(", "));
        self.progress.on_progress(&BuildEvent::StepSkipped {
            step: step.name.clone(),
            blocked_by: blocked_by.clone(),
        });
        StepReport {
            step: step.name.clone(),
            image: self.session.unique_step_name(&step.name),
            level,
            outcome: StepOutcome::NotAttempted { blocked_by },
            duration: Duration::ZERO,
        }
    }

    /// Removes images of succeeded steps except the final step's.
    async fn remove_step_images(&self, outcomes: &[StepReport]) {
        let final_step = self.manifest.final_step().map(|s| s.name.as_str());
        let options = ImageRemoval {
            force: self.config.force_rm_images,
            no_prune: self.config.no_prune_rm_images,
        };

        for report in outcomes {
            if Some(report.step.as_str()) == final_step || !report.outcome.is_success() {
                continue;
            }
            debug!("Removing unwanted image {}", report.image);
            if let Err(e) = self.docker.remove_image(&report.image, options).await {
                warn!("Failed to remove image {}: {}", report.image, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{DaemonCall, MockDaemon};
    use crate::manifest::Step;
    use crate::progress::NoOpHandler;
    use tempfile::TempDir;

    fn setup(dockerfiles: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in dockerfiles {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn config(dir: &TempDir) -> BuildConfig {
        BuildConfig {
            workdir: dir.path().to_path_buf(),
            unique_id: String::new(),
            keep_steps: true,
            keep_artifacts: true,
            no_squash: true,
            failure_policy: FailurePolicy::AbortRun,
            cancel_siblings_on_failure: false,
            ..BuildConfig::default()
        }
    }

    fn builder(manifest: Manifest, config: BuildConfig, daemon: Arc<MockDaemon>) -> Builder {
        Builder::new(manifest, config, daemon).with_progress(Arc::new(NoOpHandler))
    }

    #[tokio::test]
    async fn test_chain_builds_in_order() {
        let dir = setup(&[
            ("base.Dockerfile", "FROM alpine\n"),
            ("app.Dockerfile", "FROM base\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("base", "base.Dockerfile"),
            Step::new("app", "app.Dockerfile"),
        ]);
        let daemon = Arc::new(MockDaemon::new());

        let report = builder(manifest, config(&dir), daemon.clone()).run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(daemon.built_tags(), vec!["base", "app"]);
        assert_eq!(report.outcomes[1].level, 1);
    }

    #[tokio::test]
    async fn test_schedule_error_runs_nothing() {
        let dir = setup(&[("a.Dockerfile", "FROM alpine\n")]);
        let manifest = Manifest::new(vec![Step::new("a", "a.Dockerfile").with_dependency("ghost")]);
        let daemon = Arc::new(MockDaemon::new());

        let err = builder(manifest, config(&dir), daemon.clone()).run().await.unwrap_err();

        assert!(matches!(err, ScheduleError::UnknownDependency { .. }));
        assert!(daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_abort_run_skips_later_levels() {
        let dir = setup(&[
            ("a.Dockerfile", "FROM alpine\n"),
            ("b.Dockerfile", "FROM alpine\n"),
            ("c.Dockerfile", "FROM a\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("a", "a.Dockerfile"),
            Step::new("b", "b.Dockerfile"),
            Step::new("c", "c.Dockerfile"),
        ]);
        let daemon = Arc::new(MockDaemon::new().fail_build("b"));

        let report = builder(manifest, config(&dir), daemon.clone()).run().await.unwrap();

        assert_eq!(report.succeeded_steps(), vec!["a"]);
        assert_eq!(report.failed_steps(), vec!["b"]);
        assert_eq!(
            report.outcome_of("c"),
            Some(&StepOutcome::NotAttempted {
                blocked_by: vec!["b".to_string()]
            })
        );
        assert!(!daemon.built_tags().contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_continue_independent_runs_unaffected_steps() {
        let dir = setup(&[
            ("a.Dockerfile", "FROM alpine\n"),
            ("b.Dockerfile", "FROM alpine\n"),
            ("c.Dockerfile", "FROM a\n"),
            ("d.Dockerfile", "FROM b\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("a", "a.Dockerfile"),
            Step::new("b", "b.Dockerfile"),
            Step::new("c", "c.Dockerfile"),
            Step::new("d", "d.Dockerfile"),
        ]);
        let daemon = Arc::new(MockDaemon::new().fail_build("b"));
        let config = BuildConfig {
            failure_policy: FailurePolicy::ContinueIndependent,
            ..config(&dir)
        };

        let report = builder(manifest, config, daemon).run().await.unwrap();

        assert_eq!(report.succeeded_steps(), vec!["a", "c"]);
        assert_eq!(
            report.outcome_of("d"),
            Some(&StepOutcome::NotAttempted {
                blocked_by: vec!["b".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn test_image_cleanup_keeps_final_and_failed() {
        let dir = setup(&[
            ("a.Dockerfile", "FROM alpine\n"),
            ("b.Dockerfile", "FROM alpine\n"),
            ("c.Dockerfile", "FROM a\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("a", "a.Dockerfile"),
            Step::new("b", "b.Dockerfile"),
            Step::new("c", "c.Dockerfile"),
        ]);
        let daemon = Arc::new(MockDaemon::new().fail_build("b"));
        let config = BuildConfig {
            keep_steps: false,
            failure_policy: FailurePolicy::ContinueIndependent,
            ..config(&dir)
        };

        builder(manifest, config, daemon.clone()).run().await.unwrap();

        assert_eq!(daemon.removed_images(), vec!["a".to_string()]);
        assert!(daemon.has_image("c"));
    }

    #[tokio::test]
    async fn test_level_is_a_barrier() {
        let dir = setup(&[
            ("slow.Dockerfile", "FROM alpine\n"),
            ("fast.Dockerfile", "FROM alpine\n"),
            ("next.Dockerfile", "FROM fast\n"),
        ]);
        let manifest = Manifest::new(vec![
            Step::new("slow", "slow.Dockerfile"),
            Step::new("fast", "fast.Dockerfile"),
            Step::new("next", "next.Dockerfile"),
        ]);
        let daemon = Arc::new(MockDaemon::new().with_build_delay("slow", Duration::from_millis(50)));

        builder(manifest, config(&dir), daemon.clone()).run().await.unwrap();

        let builds: Vec<String> = daemon
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DaemonCall::Build { tag, .. } => Some(tag),
                _ => None,
            })
            .collect();
        assert_eq!(builds.last().map(String::as_str), Some("next"));
        assert_eq!(daemon.built_tags().last().map(String::as_str), Some("next"));
    }
}
