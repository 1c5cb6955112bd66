//! Line-oriented build-file parser.
//!
//! Produces a root [`Node`] whose children are instructions. Each instruction
//! node carries its lowercased keyword in `value`, extracted `--flags`, the
//! joined source text in `original`, and its arguments as a `next` chain.

use crate::error::ParseError;
use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_ESCAPE_TOKEN: char = '\\';

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#\s*([a-zA-Z][a-zA-Z0-9]*)\s*=\s*(.+?)\s*$").expect("valid directive regex")
    })
}

/// Parser directives found in the leading comment block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    pub escape: char,
    pub syntax: Option<String>,
    pub looking_for_directives: bool,
    escape_seen: bool,
}

impl Default for Directives {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Directives {
    pub fn new(looking_for_directives: bool) -> Self {
        Self {
            escape: DEFAULT_ESCAPE_TOKEN,
            syntax: None,
            looking_for_directives,
            escape_seen: false,
        }
    }

    pub fn set_escape_token(&mut self, token: &str) -> Result<(), String> {
        match token {
            "\\" => self.escape = '\\',
            "`" => self.escape = '`',
            other => return Err(format!("invalid escape token '{}' does not match ` or \\", other)),
        }
        Ok(())
    }

    /// Handles one candidate directive line. Returns true when the line was
    /// consumed as a directive.
    fn detect(&mut self, line: &str, line_no: usize) -> Result<bool, ParseError> {
        if !self.looking_for_directives {
            return Ok(false);
        }

        let Some(caps) = directive_regex().captures(line) else {
            self.looking_for_directives = false;
            return Ok(false);
        };

        let name = caps[1].to_lowercase();
        let value = caps[2].to_string();
        match name.as_str() {
            "escape" => {
                if self.escape_seen {
                    return Err(ParseError::new(line_no, "only one escape parser directive can be used"));
                }
                self.set_escape_token(&value)
                    .map_err(|e| ParseError::new(line_no, e))?;
                self.escape_seen = true;
                Ok(true)
            }
            "syntax" => {
                if self.syntax.is_some() {
                    return Err(ParseError::new(line_no, "only one syntax parser directive can be used"));
                }
                self.syntax = Some(value);
                Ok(true)
            }
            _ => {
                // unknown directives read as plain comments
                self.looking_for_directives = false;
                Ok(false)
            }
        }
    }
}

/// How an instruction's arguments are laid out in its `next` chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeForm {
    /// Whitespace separated words, quotes kept intact
    #[default]
    Words,
    /// Exec form `["a", "b"]`
    Json,
    /// A single raw string (shell form)
    Raw,
    /// `KEY=value` pairs, stored as alternating key and value nodes
    NameValue,
    /// Legacy `KEY some value` form
    LegacyNameValue,
    /// The single `next` node holds a nested instruction in `children`
    Nested,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub value: String,
    pub next: Option<Box<Node>>,
    pub children: Vec<Node>,
    pub flags: Vec<String>,
    pub original: String,
    pub form: NodeForm,
    pub start_line: usize,
    pub end_line: usize,
}

impl Node {
    fn leaf(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    /// Iterates over the argument chain.
    pub fn args(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(self.next.as_deref(), |n| n.next.as_deref())
    }

    pub fn arg_values(&self) -> Vec<&str> {
        self.args().map(|n| n.value.as_str()).collect()
    }

    pub fn is_instruction(&self, keyword: &str) -> bool {
        self.value == keyword
    }
}

fn chain(values: Vec<Node>) -> Option<Box<Node>> {
    values.into_iter().rev().fold(None, |next, mut node| {
        node.next = next;
        Some(Box::new(node))
    })
}

/// A parsed build file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    pub ast: Node,
    pub directives: Directives,
}

/// Parses a build file's text.
pub fn parse(content: &str, mut directives: Directives) -> Result<ParseResult, ParseError> {
    let mut root = Node::default();
    let mut buffer = String::new();
    let mut start_line = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if directives.detect(line.trim(), line_no)? {
            continue;
        }

        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let segment = if buffer.is_empty() {
            start_line = line_no;
            trimmed
        } else {
            line
        };

        let end_trimmed = segment.trim_end();
        if let Some(stripped) = end_trimmed.strip_suffix(directives.escape) {
            buffer.push_str(stripped);
            continue;
        }

        buffer.push_str(segment);
        root.children
            .push(parse_instruction(&buffer, start_line, line_no, directives.escape)?);
        buffer.clear();
    }

    if !buffer.trim().is_empty() {
        let end = content.lines().count();
        root.children
            .push(parse_instruction(&buffer, start_line, end, directives.escape)?);
    }

    if let (Some(first), Some(last)) = (root.children.first(), root.children.last()) {
        root.start_line = first.start_line;
        root.end_line = last.end_line;
    }

    Ok(ParseResult {
        ast: root,
        directives,
    })
}

fn parse_instruction(
    line: &str,
    start_line: usize,
    end_line: usize,
    escape: char,
) -> Result<Node, ParseError> {
    let line = line.trim();
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim_start()),
        None => (line, ""),
    };
    let value = keyword.to_lowercase();
    let (flags, rest) = extract_flags(rest);

    let err = |message: String| ParseError::new(start_line, message);

    if rest.is_empty() {
        return Err(err(format!("{} requires at least one argument", keyword.to_uppercase())));
    }

    let (form, next) = match value.as_str() {
        "run" | "cmd" | "entrypoint" | "shell" => match parse_json(rest) {
            Some(items) => (NodeForm::Json, chain(items.into_iter().map(Node::leaf).collect())),
            None => (NodeForm::Raw, raw_arg(rest)),
        },
        "copy" | "add" | "volume" => match parse_json(rest) {
            Some(items) => (NodeForm::Json, chain(items.into_iter().map(Node::leaf).collect())),
            None => (NodeForm::Words, words_arg(rest, escape).map_err(err)?),
        },
        "env" | "label" => parse_name_values(rest, escape).map_err(err)?,
        "onbuild" => {
            let (inner_keyword, _) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            match inner_keyword.to_lowercase().as_str() {
                "onbuild" => return Err(err("chaining ONBUILD via `ONBUILD ONBUILD` isn't allowed".into())),
                "from" | "maintainer" => {
                    return Err(err(format!("{} isn't allowed as an ONBUILD trigger", inner_keyword.to_uppercase())))
                }
                _ => {}
            }
            let inner = parse_instruction(rest, start_line, end_line, escape)?;
            let holder = Node {
                children: vec![inner],
                ..Default::default()
            };
            (NodeForm::Nested, Some(Box::new(holder)))
        }
        "from" | "expose" | "arg" | "stopsignal" => {
            (NodeForm::Words, words_arg(rest, escape).map_err(err)?)
        }
        _ => (NodeForm::Raw, raw_arg(rest)),
    };

    Ok(Node {
        value,
        next,
        children: Vec::new(),
        flags,
        original: line.to_string(),
        form,
        start_line,
        end_line,
    })
}

fn extract_flags(mut rest: &str) -> (Vec<String>, &str) {
    let mut flags = Vec::new();
    while rest.starts_with("--") {
        let (flag, remainder) = match rest.split_once(char::is_whitespace) {
            Some((f, r)) => (f, r.trim_start()),
            None => (rest, ""),
        };
        if flag == "--" {
            break;
        }
        flags.push(flag.to_string());
        rest = remainder;
    }
    (flags, rest)
}

fn parse_json(rest: &str) -> Option<Vec<String>> {
    if !rest.starts_with('[') {
        return None;
    }
    serde_json::from_str::<Vec<String>>(rest).ok()
}

fn raw_arg(rest: &str) -> Option<Box<Node>> {
    if rest.is_empty() {
        None
    } else {
        Some(Box::new(Node::leaf(rest)))
    }
}

fn words_arg(rest: &str, escape: char) -> Result<Option<Box<Node>>, String> {
    let words = split_words(rest, escape)?;
    Ok(chain(words.into_iter().map(Node::leaf).collect()))
}

fn parse_name_values(rest: &str, escape: char) -> Result<(NodeForm, Option<Box<Node>>), String> {
    let words = split_words(rest, escape)?;
    let Some(first) = words.first() else {
        return Ok((NodeForm::NameValue, None));
    };

    if !first.contains('=') {
        let value = rest[first.len()..].trim_start();
        let nodes = vec![Node::leaf(first.as_str()), Node::leaf(value)];
        return Ok((NodeForm::LegacyNameValue, chain(nodes)));
    }

    let mut nodes = Vec::with_capacity(words.len() * 2);
    for word in words {
        let Some((key, value)) = word.split_once('=') else {
            return Err(format!("syntax error - can't find = in \"{}\". Must be of the form: name=value", word));
        };
        nodes.push(Node::leaf(key));
        nodes.push(Node::leaf(value));
    }
    Ok((NodeForm::NameValue, chain(nodes)))
}

/// Splits on unquoted whitespace, keeping quotes and escapes in the words.
fn split_words(input: &str, escape: char) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c == escape && quote != Some('\'') {
            current.push(c);
            if let Some(escaped) = chars.next() {
                current.push(escaped);
            }
            continue;
        }

        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote in \"{}\"", q, input));
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(content: &str) -> ParseResult {
        parse(content, Directives::default()).unwrap()
    }

    #[test]
    fn test_parses_instructions_in_order() {
        let result = parse_default("FROM alpine:3.19\nRUN apk add curl\nCMD [\"sh\"]\n");
        let values: Vec<_> = result.ast.children.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(values, vec!["from", "run", "cmd"]);
    }

    #[test]
    fn test_from_words_and_flags() {
        let result = parse_default("FROM --platform=linux/amd64 base:1.0 AS build\n");
        let from = &result.ast.children[0];
        assert_eq!(from.flags, vec!["--platform=linux/amd64".to_string()]);
        assert_eq!(from.arg_values(), vec!["base:1.0", "AS", "build"]);
    }

    #[test]
    fn test_line_continuation_and_comments() {
        let content = "FROM base\nRUN apt-get update && \\\n# inner comment\n    apt-get install -y curl\n";
        let result = parse_default(content);
        let run = &result.ast.children[1];
        assert_eq!(run.form, NodeForm::Raw);
        assert_eq!(run.arg_values(), vec!["apt-get update &&     apt-get install -y curl"]);
        assert_eq!(run.start_line, 2);
        assert_eq!(run.end_line, 4);
    }

    #[test]
    fn test_escape_directive_changes_continuation() {
        let content = "# escape=`\nFROM base\nRUN dir `\n  c:\\\n";
        let result = parse_default(content);
        assert_eq!(result.directives.escape, '`');
        let run = &result.ast.children[1];
        assert_eq!(run.arg_values(), vec!["dir   c:\\"]);
    }

    #[test]
    fn test_directives_ignored_after_instruction() {
        let result = parse_default("FROM base\n# escape=`\n");
        assert_eq!(result.directives.escape, '\\');
        assert!(!result.directives.looking_for_directives);
    }

    #[test]
    fn test_directives_not_detected_when_disabled() {
        let result = parse("# escape=`\nFROM base\n", Directives::new(false)).unwrap();
        assert_eq!(result.directives.escape, '\\');
    }

    #[test]
    fn test_syntax_directive() {
        let result = parse_default("# syntax=docker/dockerfile:1\nFROM base\n");
        assert_eq!(result.directives.syntax.as_deref(), Some("docker/dockerfile:1"));
    }

    #[test]
    fn test_duplicate_escape_directive_rejected() {
        let err = parse("# escape=`\n# escape=\\\nFROM base\n", Directives::default()).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_invalid_escape_token_rejected() {
        assert!(parse("# escape=x\nFROM base\n", Directives::default()).is_err());
    }

    #[test]
    fn test_json_form() {
        let result = parse_default("ENTRYPOINT [\"/bin/app\", \"--serve\"]\n");
        let node = &result.ast.children[0];
        assert_eq!(node.form, NodeForm::Json);
        assert_eq!(node.arg_values(), vec!["/bin/app", "--serve"]);
    }

    #[test]
    fn test_env_name_value_pairs() {
        let result = parse_default("ENV A=1 B=\"two words\"\n");
        let env = &result.ast.children[0];
        assert_eq!(env.form, NodeForm::NameValue);
        assert_eq!(env.arg_values(), vec!["A", "1", "B", "\"two words\""]);
    }

    #[test]
    fn test_env_legacy_form() {
        let result = parse_default("ENV PATH /usr/local/bin:/usr/bin\n");
        let env = &result.ast.children[0];
        assert_eq!(env.form, NodeForm::LegacyNameValue);
        assert_eq!(env.arg_values(), vec!["PATH", "/usr/local/bin:/usr/bin"]);
    }

    #[test]
    fn test_onbuild_nested() {
        let result = parse_default("ONBUILD RUN make\n");
        let onbuild = &result.ast.children[0];
        assert_eq!(onbuild.form, NodeForm::Nested);
        let inner = &onbuild.next.as_ref().unwrap().children[0];
        assert_eq!(inner.value, "run");
    }

    #[test]
    fn test_onbuild_from_rejected() {
        assert!(parse("ONBUILD FROM base\n", Directives::default()).is_err());
    }

    #[test]
    fn test_unterminated_quote_rejected() {
        let err = parse("FROM base\nLABEL a=\"open\n", Directives::default()).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_instruction_without_argument_rejected() {
        let err = parse("FROM base\nRUN\n", Directives::default()).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("RUN requires"));
    }

    #[test]
    fn test_crlf_line_endings() {
        let result = parse_default("FROM base\r\nRUN make\r\n");
        assert_eq!(result.ast.children[1].arg_values(), vec!["make"]);
    }
}
