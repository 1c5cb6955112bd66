//! Per-run identity and naming rules.
//!
//! Every run gets a fresh builder id; the optional unique id is mixed into
//! image names so concurrent runs on one daemon do not collide.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

pub const GENERATED_SUFFIX: &str = ".generated";

fn container_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/?[^a-zA-Z0-9_-]+").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub unique_id: String,
    pub builder_id: String,
}

impl Session {
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            builder_id: Uuid::new_v4().to_string(),
        }
    }

    /// Image name a step is built as.
    ///
    /// Lowercased. With a unique id the id is inserted before the tag, if
    /// the name carries one: `app:1.0` with id `x1` becomes `app-x1:1.0`.
    /// A colon followed by a `/` is a registry port, not a tag.
    pub fn unique_step_name(&self, name: &str) -> String {
        if self.unique_id.is_empty() {
            return name.to_lowercase();
        }

        let combined = match name.rfind(':') {
            Some(idx) if !name[idx + 1..].contains('/') => {
                format!("{}-{}{}", &name[..idx], self.unique_id, &name[idx..])
            }
            _ => format!("{}-{}", name, self.unique_id),
        };
        combined.to_lowercase()
    }

    /// Name for a transient container created from `image`.
    pub fn container_name(&self, image: &str) -> String {
        let sanitized = container_name_regex().replace_all(image, "-");
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}.{}", sanitized, &suffix[..16])
    }
}

/// Path of the rewritten build file, next to the original.
pub fn generated_dockerfile_path(dockerfile: &Path) -> PathBuf {
    let mut name = dockerfile.as_os_str().to_os_string();
    name.push(GENERATED_SUFFIX);
    PathBuf::from(name)
}
