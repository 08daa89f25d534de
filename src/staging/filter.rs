//! Glob-style name filters for staging plans.
//!
//! Patterns are matched against a single path component (file or directory
//! name), case-insensitively, with `*` and `?` wildcards. `*.jpg` therefore
//! matches `000001.JPG` at any depth of the mirrored tree.

use std::ffi::OsStr;

use regex::Regex;

use crate::error::PipelineError;
use crate::pipeline::config::ConfigError;

/// Compiled set of name patterns.
#[derive(Debug, Clone)]
pub struct NameFilter {
    regex: Option<Regex>,
}

impl NameFilter {
    /// Compiles `patterns`; an empty list matches nothing.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PipelineError> {
        if patterns.is_empty() {
            return Ok(Self { regex: None });
        }

        let alternatives: Vec<String> = patterns
            .iter()
            .map(|p| glob_to_regex(p.as_ref()))
            .collect();
        let source = format!("(?i)^(?:{})$", alternatives.join("|"));
        let regex = Regex::new(&source).map_err(|e| {
            PipelineError::Config(ConfigError::InvalidValue {
                key: "include_patterns".to_string(),
                message: e.to_string(),
            })
        })?;

        Ok(Self { regex: Some(regex) })
    }

    /// Whether `name` matches any pattern. Non UTF-8 names never match.
    pub fn matches(&self, name: &OsStr) -> bool {
        match (&self.regex, name.to_str()) {
            (Some(regex), Some(name)) => regex.is_match(name),
            _ => false,
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}
