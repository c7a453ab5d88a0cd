//! Filter and rewrite rules.
//!
//! Rules are parsed once at startup from their raw configuration strings:
//! - `/pattern/` → case-insensitive, multi-line regex
//! - anything else → case-insensitive substring
//! - `pattern->replacement` (rewrite rules only) → replace every match
//!
//! A malformed rule is a `ConfigError`, never a mid-stream failure.

use std::ops::Range;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::filter::TextEdit;

/// How a rule's pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Substring,
    Regex,
}

/// A single pattern with a compiled matcher.
///
/// Substring patterns are compiled as escaped regexes so case-insensitive
/// matching works on Unicode text without re-deriving byte offsets.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pattern: String,
    mode: MatchMode,
    regex: Regex,
}

impl FilterRule {
    /// Case-insensitive substring rule.
    pub fn substring(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.trim().is_empty() {
            return Err(ConfigError::InvalidRule {
                rule: pattern.into(),
                reason: "pattern is empty".into(),
            });
        }
        Ok(Self {
            pattern: pattern.into(),
            mode: MatchMode::Substring,
            regex: compile(&regex::escape(pattern), pattern)?,
        })
    }

    /// Case-insensitive regex rule.
    pub fn regex(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            pattern: pattern.into(),
            mode: MatchMode::Regex,
            regex: compile(pattern, pattern)?,
        })
    }

    /// Parse a raw rule: `/.../` is a regex, anything else a substring.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        match raw.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
            Some(inner) if !inner.is_empty() => Self::regex(inner),
            _ => Self::substring(raw),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    fn find_ranges(&self, text: &str) -> Vec<Range<usize>> {
        self.regex
            .find_iter(text)
            .filter(|m| !m.range().is_empty())
            .map(|m| m.range())
            .collect()
    }
}

fn compile(source: &str, rule: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .map_err(|e| ConfigError::InvalidRule {
            rule: rule.into(),
            reason: e.to_string(),
        })
}

/// Replace every match of a pattern (used to strip promotional text).
#[derive(Debug, Clone)]
pub struct RewriteRule {
    rule: FilterRule,
    replacement: String,
}

impl RewriteRule {
    pub fn new(rule: FilterRule, replacement: impl Into<String>) -> Self {
        Self {
            rule,
            replacement: replacement.into(),
        }
    }

    /// Parse `pattern->replacement`. A missing `->` means "remove the pattern".
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.split_once("->") {
            Some((pattern, replacement)) => {
                Ok(Self::new(FilterRule::parse(pattern)?, replacement.trim()))
            }
            None => Ok(Self::new(FilterRule::parse(raw)?, "")),
        }
    }

    pub fn pattern(&self) -> &str {
        self.rule.pattern()
    }

    /// Compute the edits this rule makes to `text`.
    ///
    /// Regex rules expand capture references (`$1`, `${name}`) in the
    /// replacement; substring rules insert it literally.
    pub fn edits(&self, text: &str) -> Vec<TextEdit> {
        match self.rule.mode {
            MatchMode::Substring => self
                .rule
                .find_ranges(text)
                .into_iter()
                .map(|range| TextEdit::new(range, self.replacement.clone()))
                .collect(),
            MatchMode::Regex => self
                .rule
                .regex
                .captures_iter(text)
                .filter_map(|caps| {
                    let whole = caps.get(0)?;
                    if whole.range().is_empty() {
                        return None;
                    }
                    let mut replacement = String::new();
                    caps.expand(&self.replacement, &mut replacement);
                    Some(TextEdit::new(whole.range(), replacement))
                })
                .collect(),
        }
    }
}

/// How hidden links are neutralised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPolicy {
    /// Show the target URL in place of a differing display text.
    #[default]
    Unmask,
    /// Keep the display text and drop the link entirely.
    Remove,
}

impl std::str::FromStr for LinkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unmask" => Ok(Self::Unmask),
            "remove" => Ok(Self::Remove),
            other => Err(format!("expected \"unmask\" or \"remove\", got {other:?}")),
        }
    }
}

/// The ordered text rules one relay applies.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    filters: Vec<FilterRule>,
    rewrites: Vec<RewriteRule>,
    link_policy: LinkPolicy,
}

impl RuleSet {
    /// An empty rule set (passes everything through).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse raw filter and rewrite strings, failing on the first bad rule.
    pub fn parse<F, R>(filters: F, rewrites: R) -> Result<Self, ConfigError>
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        let filters = filters
            .into_iter()
            .map(|raw| FilterRule::parse(raw.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let rewrites = rewrites
            .into_iter()
            .map(|raw| RewriteRule::parse(raw.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            filters = filters.len(),
            rewrites = rewrites.len(),
            "Rule set compiled"
        );
        Ok(Self {
            filters,
            rewrites,
            link_policy: LinkPolicy::default(),
        })
    }

    pub fn with_link_policy(mut self, policy: LinkPolicy) -> Self {
        self.link_policy = policy;
        self
    }

    pub fn add_rewrite(&mut self, rule: RewriteRule) {
        self.rewrites.push(rule);
    }

    pub fn link_policy(&self) -> LinkPolicy {
        self.link_policy
    }

    pub fn rewrites(&self) -> &[RewriteRule] {
        &self.rewrites
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// First filter rule (in configuration order) matching `text`.
    pub fn first_match(&self, text: &str) -> Option<&FilterRule> {
        if text.is_empty() {
            return None;
        }
        self.filters.iter().find(|rule| rule.is_match(text))
    }
}
