//! History squashing
//!
//! A [`Squasher`] turns an exported image archive into an archive with a
//! single flattened layer, tagged for reload under a target name.

mod layer;

pub use layer::LayerSquasher;

use crate::error::SquashError;
use std::path::Path;

pub trait Squasher: Send + Sync {
    /// Reads `input`, writes the flattened archive to `output` tagged as
    /// `target`.
    fn squash(&self, input: &Path, output: &Path, target: &str) -> Result<(), SquashError>;
}
