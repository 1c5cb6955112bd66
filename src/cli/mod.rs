pub mod commands;
pub mod handlers;

pub use commands::{BuildArgs, CliArgs, Commands, LevelsArgs};
pub use handlers::{handle_build, handle_levels};
