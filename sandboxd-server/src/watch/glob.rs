//! Glob patterns compiled to anchored, literal-escaped regexes
//!
//! Only `*` (any run of characters) and `?` (exactly one character) are
//! special; every other character, including `[`, `(`, `|` and `+`,
//! matches itself. The `regex` crate matches in linear time, so hostile
//! patterns cannot cause catastrophic backtracking.

use regex::Regex;

use sandboxd_utils::{Result, SandboxError};

/// Longest accepted pattern
pub const MAX_PATTERN_LEN: usize = 1024;

/// Translate a glob into an anchored regex source string
pub fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?s)^");

    let mut utf8 = [0u8; 4];
    let mut previous_star = false;
    for ch in pattern.chars() {
        match ch {
            '*' => {
                if !previous_star {
                    out.push_str(".*");
                }
            }
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut utf8))),
        }
        previous_star = ch == '*';
    }

    out.push('$');
    out
}

/// A compiled glob
#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(SandboxError::InvalidPattern("empty pattern".into()));
        }
        if pattern.len() > MAX_PATTERN_LEN {
            return Err(SandboxError::InvalidPattern(format!(
                "pattern longer than {} characters",
                MAX_PATTERN_LEN
            )));
        }

        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| SandboxError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Match against the whole path or its file name
    pub fn matches_path(&self, path: &str) -> bool {
        self.is_match(path) || basename(path).map_or(false, |name| self.is_match(name))
    }

    /// Match against the whole path or any one of its components
    pub fn matches_component(&self, path: &str) -> bool {
        self.is_match(path)
            || path
                .split('/')
                .filter(|c| !c.is_empty())
                .any(|component| self.is_match(component))
    }
}

fn basename(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

/// Include/exclude filter applied to event paths
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<Glob>,
    excludes: Vec<Glob>,
}

impl PathFilter {
    pub fn new(patterns: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: patterns.iter().map(|p| Glob::new(p)).collect::<Result<_>>()?,
            excludes: excludes.iter().map(|p| Glob::new(p)).collect::<Result<_>>()?,
        })
    }

    /// Excluded paths never pass; with no patterns everything else does
    pub fn admits(&self, path: &str) -> bool {
        if self.excludes.iter().any(|g| g.matches_component(path)) {
            return false;
        }
        self.patterns.is_empty() || self.patterns.iter().any(|g| g.matches_path(path))
    }
}
