//! Build-file parsing and rewriting

pub mod parser;
pub mod rewrite;

pub use parser::{parse, Directives, Node, NodeForm, ParseResult, DEFAULT_ESCAPE_TOKEN};
pub use rewrite::{base_images, dump, rewrite_base_images, rewrite_step};
