//! Progress reporting for build runs

mod handler;
mod logging;

pub use handler::{BuildEvent, NoOpHandler, ProgressHandler, StepPhase};
pub use logging::LoggingHandler;
