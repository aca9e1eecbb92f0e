//! Expected-output patterns

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::error::Result;

/// How a pattern string is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Literal substring
    #[default]
    Exact,
    /// Regular expression
    Regex,
}

/// One pattern a transaction may complete on
#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(String),
    Regex(Regex),
    /// Whatever prompt the session learned at login
    Prompt,
}

impl Pattern {
    pub fn exact(text: impl Into<String>) -> Self {
        Pattern::Exact(text.into())
    }

    pub fn regex(expr: &str) -> Result<Self> {
        Ok(Pattern::Regex(Regex::new(expr)?))
    }

    pub fn parse(text: &str, mode: MatchMode) -> Result<Self> {
        match mode {
            MatchMode::Exact => Ok(Pattern::exact(text)),
            MatchMode::Regex => Pattern::regex(text),
        }
    }

    /// Byte range of the first occurrence in `haystack`
    pub fn find(&self, haystack: &str, prompt: Option<&str>) -> Option<Range<usize>> {
        match self {
            Pattern::Exact(text) => haystack
                .find(text.as_str())
                .map(|start| start..start + text.len()),
            Pattern::Regex(re) => re.find(haystack).map(|m| m.range()),
            Pattern::Prompt => {
                let prompt = prompt.filter(|p| !p.is_empty())?;
                haystack
                    .find(prompt)
                    .map(|start| start..start + prompt.len())
            }
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(text) => write!(f, "'{}'", text),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
            Pattern::Prompt => write!(f, "<prompt>"),
        }
    }
}

/// Where a pattern matched and which one it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Position of the pattern in the expectation list
    pub index: usize,
    pub range: Range<usize>,
}

/// The match that starts earliest in `haystack`; ties go to the pattern
/// listed first
pub fn find_earliest(
    patterns: &[Pattern],
    haystack: &str,
    prompt: Option<&str>,
) -> Option<PatternMatch> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(index, pattern)| {
            pattern
                .find(haystack, prompt)
                .map(|range| PatternMatch { index, range })
        })
        .min_by_key(|m| (m.range.start, m.index))
}

/// Serializable pattern, as written in apply plans
///
/// ```toml
/// expect = [{ exact = "Update Complete" }, { regex = "Power (.*) required" }, "prompt"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSpec {
    Exact(String),
    Regex(String),
    Prompt,
}

impl PatternSpec {
    pub fn exact(text: impl Into<String>) -> Self {
        PatternSpec::Exact(text.into())
    }

    pub fn regex(expr: impl Into<String>) -> Self {
        PatternSpec::Regex(expr.into())
    }

    pub fn compile(&self) -> Result<Pattern> {
        match self {
            PatternSpec::Exact(text) => Ok(Pattern::exact(text.clone())),
            PatternSpec::Regex(expr) => Pattern::regex(expr),
            PatternSpec::Prompt => Ok(Pattern::Prompt),
        }
    }
}
