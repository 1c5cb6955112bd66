//! Progress handler trait and events

use std::fmt;
use std::time::Duration;

/// Phases a single step moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepPhase {
    Rewrite,
    BuildImage,
    CreateContainer,
    Cleanup,
    Squash,
    FetchArtifacts,
    RunCommand,
    RemoveContainer,
    Finish,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepPhase::Rewrite => "rewrite",
            StepPhase::BuildImage => "build-image",
            StepPhase::CreateContainer => "create-container",
            StepPhase::Cleanup => "cleanup",
            StepPhase::Squash => "squash",
            StepPhase::FetchArtifacts => "fetch-artifacts",
            StepPhase::RunCommand => "run-command",
            StepPhase::RemoveContainer => "remove-container",
            StepPhase::Finish => "finish",
        };
        f.write_str(name)
    }
}

/// Events emitted during a build run
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// Run started
    RunStarted { steps: usize, levels: usize },

    /// All steps of a level were launched
    LevelStarted { level: usize, steps: Vec<String> },

    StepStarted { step: String, image: String },

    PhaseStarted { step: String, phase: StepPhase },

    StepCompleted { step: String, duration: Duration },

    StepFailed { step: String, error: String },

    /// Step was not attempted because an earlier step failed
    StepSkipped { step: String, blocked_by: Vec<String> },

    LevelCompleted { level: usize, failures: usize },

    /// Run finished, successfully or not
    RunCompleted {
        succeeded: usize,
        failed: usize,
        skipped: usize,
        total_time: Duration,
    },
}

/// Trait for handling progress events during a build
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &BuildEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &BuildEvent) {}
}
