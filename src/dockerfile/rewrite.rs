use super::parser::{Directives, Node, NodeForm, ParseResult, DEFAULT_ESCAPE_TOKEN};
use crate::error::BuildError;
use crate::manifest::{Manifest, Step};
use crate::session::{generated_dockerfile_path, Session};
use std::path::{Path, PathBuf};
use tracing::debug;

/// How one instruction is turned back into text.
#[derive(Debug)]
enum Rendering<'a> {
    /// Emit the source text as written
    Verbatim(&'a str),
    Words(Vec<&'a str>),
    Json(Vec<&'a str>),
    Raw(&'a str),
    Pairs { pairs: Vec<(&'a str, &'a str)>, legacy: bool },
    Nested(&'a Node),
}

impl<'a> Rendering<'a> {
    fn of(node: &'a Node) -> Self {
        // exec-vs-shell quoting of CMD is easy to distort, keep it literal
        if node.is_instruction("cmd") && !node.original.is_empty() {
            return Rendering::Verbatim(&node.original);
        }

        let values = node.arg_values();
        match node.form {
            NodeForm::Words => Rendering::Words(values),
            NodeForm::Json => Rendering::Json(values),
            NodeForm::Raw => Rendering::Raw(values.first().copied().unwrap_or_default()),
            NodeForm::NameValue | NodeForm::LegacyNameValue => Rendering::Pairs {
                pairs: values.chunks(2).map(|kv| (kv[0], kv.get(1).copied().unwrap_or_default())).collect(),
                legacy: node.form == NodeForm::LegacyNameValue,
            },
            NodeForm::Nested => match node.next.as_deref().and_then(|n| n.children.first()) {
                Some(inner) => Rendering::Nested(inner),
                None => Rendering::Raw(""),
            },
        }
    }

    fn render(&self) -> String {
        match self {
            Rendering::Verbatim(text) => text.to_string(),
            Rendering::Words(words) => words.join(" "),
            Rendering::Json(items) => serde_json::to_string(items).unwrap_or_default(),
            Rendering::Raw(text) => text.to_string(),
            Rendering::Pairs { pairs, legacy: true } => pairs
                .iter()
                .map(|(k, v)| format!("{} {}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
            Rendering::Pairs { pairs, legacy: false } => pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
            Rendering::Nested(inner) => render_instruction(inner),
        }
    }
}

fn render_instruction(node: &Node) -> String {
    let rendering = Rendering::of(node);
    if let Rendering::Verbatim(text) = rendering {
        return text.to_string();
    }

    let mut line = node.value.to_uppercase();
    for flag in &node.flags {
        line.push(' ');
        line.push_str(flag);
    }
    let args = rendering.render();
    if !args.is_empty() {
        line.push(' ');
        line.push_str(&args);
    }
    line
}

/// Serializes a parsed build file, one instruction per line.
pub fn dump(result: &ParseResult) -> String {
    let mut out = String::new();
    if let Some(syntax) = &result.directives.syntax {
        out.push_str(&format!("# syntax={}\n", syntax));
    }
    if result.directives.escape != DEFAULT_ESCAPE_TOKEN {
        out.push_str(&format!("# escape={}\n", result.directives.escape));
    }
    for child in &result.ast.children {
        out.push_str(&render_instruction(child));
        out.push('\n');
    }
    out
}

/// Base-image tokens of every top-level `FROM`, in order.
pub fn base_images(ast: &Node) -> Vec<&str> {
    ast.children
        .iter()
        .filter(|n| n.is_instruction("from"))
        .filter_map(|n| n.next.as_deref().map(|arg| arg.value.as_str()))
        .collect()
}

/// Replaces base-image tokens that `resolve` recognizes.
///
/// Fails when the file has no `FROM` at all or a `FROM` lacks its image
/// token. Returns the number of replaced tokens.
pub fn rewrite_base_images<F>(ast: &mut Node, resolve: F) -> Result<usize, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut found = false;
    let mut replaced = 0;

    for instruction in ast.children.iter_mut().filter(|n| n.is_instruction("from")) {
        found = true;
        let line = instruction.start_line;
        let Some(image) = instruction.next.as_deref_mut() else {
            return Err(format!("FROM on line {} has no image argument", line));
        };
        if let Some(unique) = resolve(&image.value) {
            debug!("Rewriting base image {} -> {}", image.value, unique);
            image.value = unique;
            replaced += 1;
        }
    }

    if !found {
        return Err("no FROM instruction found".to_string());
    }
    Ok(replaced)
}

/// Rewrites one step's build file and writes it next to the original.
///
/// Returns the path of the generated file.
pub fn rewrite_step(
    step: &Step,
    manifest: &Manifest,
    session: &Session,
    workdir: &Path,
) -> Result<PathBuf, BuildError> {
    let source = workdir.join(&step.dockerfile);
    let content = std::fs::read_to_string(&source).map_err(|e| BuildError::io(&source, e))?;

    let mut parsed = super::parse(&content, Directives::default()).map_err(|e| BuildError::Parse {
        path: source.clone(),
        source: e,
    })?;

    rewrite_base_images(&mut parsed.ast, |image| {
        manifest
            .find_step(image)
            .map(|dep| session.unique_step_name(&dep.name))
    })
    .map_err(|reason| BuildError::InvalidBuildFile {
        path: source.clone(),
        reason,
    })?;

    let target = generated_dockerfile_path(&source);
    std::fs::write(&target, dump(&parsed)).map_err(|e| BuildError::io(&target, e))?;
    debug!("Wrote generated build file {}", target.display());
    Ok(target)
}
