//! Step execution and run orchestration

pub mod artifacts;
mod executor;
mod orchestrator;
pub mod report;
mod squash;

pub use executor::{shell_command, StepExecutor};
pub use orchestrator::Builder;
pub use report::{RunReport, StepOutcome, StepReport};
pub use squash::squash_container;
