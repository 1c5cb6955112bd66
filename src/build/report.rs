use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    /// Skipped because the named steps failed or were skipped
    NotAttempted { blocked_by: Vec<String> },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    /// Session-unique image name
    pub image: String,
    pub level: usize,
    pub outcome: StepOutcome,
    pub duration: Duration,
}

/// Per-step results of one run, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<StepReport>,
    pub total_time: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|r| r.outcome.is_success())
    }

    pub fn outcome_of(&self, step: &str) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.outcome)
    }

    pub fn succeeded_steps(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, StepOutcome::Succeeded))
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, StepOutcome::Failed(_)))
    }

    pub fn skipped_steps(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, StepOutcome::NotAttempted { .. }))
    }

    fn filter(&self, pred: impl Fn(&StepOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.step.as_str())
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Build {}: {} succeeded, {} failed, {} not attempted ({:.1}s)",
            if self.is_success() { "succeeded" } else { "failed" },
            self.succeeded_steps().len(),
            self.failed_steps().len(),
            self.skipped_steps().len(),
            self.total_time.as_secs_f64()
        )?;
        for report in &self.outcomes {
            match &report.outcome {
                StepOutcome::Succeeded => writeln!(f, "  ok      {} ({})", report.step, report.image)?,
                StepOutcome::Failed(msg) => writeln!(f, "  failed  {}: {}", report.step, msg)?,
                StepOutcome::NotAttempted { blocked_by } => writeln!(
                    f,
                    "  skipped {} (blocked by {})",
                    report.step,
                    blocked_by.join(", ")
                )?,
            }
        }
        Ok(())
    }
}
