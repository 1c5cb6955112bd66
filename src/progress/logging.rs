//! Logging-based progress handler

use super::{BuildEvent, ProgressHandler};
use tracing::{debug, error, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &BuildEvent) {
        match event {
            BuildEvent::RunStarted { steps, levels } => {
                info!(steps, levels, "Starting build");
            }
            BuildEvent::LevelStarted { level, steps } => {
                info!(level, steps = %steps.join(", "), "Starting level");
            }
            BuildEvent::StepStarted { step, image } => {
                info!(step = %step, image = %image, "Building step");
            }
            BuildEvent::PhaseStarted { step, phase } => {
                debug!(step = %step, phase = %phase, "Entering phase");
            }
            BuildEvent::StepCompleted { step, duration } => {
                info!(
                    step = %step,
                    duration_ms = duration.as_millis(),
                    "Step complete"
                );
            }
            BuildEvent::StepFailed { step, error } => {
                error!(step = %step, error = %error, "Step failed");
            }
            BuildEvent::StepSkipped { step, blocked_by } => {
                warn!(
                    step = %step,
                    blocked_by = %blocked_by.join(", "),
                    "Step not attempted"
                );
            }
            BuildEvent::LevelCompleted { level, failures } => {
                if *failures > 0 {
                    warn!(level, failures, "Level complete with failures");
                } else {
                    debug!(level, "Level complete");
                }
            }
            BuildEvent::RunCompleted {
                succeeded,
                failed,
                skipped,
                total_time,
            } => {
                if *failed > 0 {
                    error!(
                        succeeded,
                        failed,
                        skipped,
                        total_time_ms = total_time.as_millis(),
                        "Build failed"
                    );
                } else {
                    info!(
                        succeeded,
                        total_time_ms = total_time.as_millis(),
                        "Build complete"
                    );
                }
            }
        }
    }
}
