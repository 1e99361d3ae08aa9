//! Ignore-file rules for the build context.
//!
//! One pattern per line, `#` comments, `!` negation. A pattern excludes a
//! path when it matches the path or one of its parent directories; the
//! last matching pattern decides.

use glob::{MatchOptions, Pattern};
use kiln_core::error::{BuildError, Result};

use crate::fsutil::clean_path;

/// Ignore files looked up at the context root, in order of preference.
pub const IGNORE_FILES: &[&str] = &[".containerignore", ".dockerignore"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    negated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    pub fn parse(content: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, body) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let cleaned = clean_path(body);
            let cleaned = cleaned.trim_start_matches('/');
            if cleaned.is_empty() {
                continue;
            }
            let pattern = Pattern::new(cleaned).map_err(|e| {
                BuildError::ContextError(format!(
                    "ignore file line {}: invalid pattern '{}': {}",
                    idx + 1,
                    body,
                    e
                ))
            })?;
            rules.push(Rule { pattern, negated });
        }
        Ok(Self { rules })
    }

    pub fn has_negations(&self) -> bool {
        self.rules.iter().any(|r| r.negated)
    }

    /// Whether `rel` (relative, `/`-separated) is excluded.
    pub fn is_excluded(&self, rel: &str) -> bool {
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            return false;
        }
        let mut excluded = false;
        for rule in &self.rules {
            if matches_self_or_parent(&rule.pattern, rel) {
                excluded = !rule.negated;
            }
        }
        excluded
    }
}

fn matches_self_or_parent(pattern: &Pattern, rel: &str) -> bool {
    if pattern.matches_with(rel, MATCH_OPTIONS) {
        return true;
    }
    rel.match_indices('/')
        .any(|(pos, _)| pattern.matches_with(&rel[..pos], MATCH_OPTIONS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_pattern_excludes_children() {
        let rules = IgnoreRules::parse("node_modules\n").unwrap();
        assert!(rules.is_excluded("node_modules"));
        assert!(rules.is_excluded("node_modules/pkg/index.js"));
        assert!(!rules.is_excluded("src/node_modules_backup"));
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let rules = IgnoreRules::parse("*.log\n").unwrap();
        assert!(rules.is_excluded("debug.log"));
        assert!(!rules.is_excluded("logs/debug.log"));
    }

    #[test]
    fn test_double_star() {
        let rules = IgnoreRules::parse("**/*.tmp\n").unwrap();
        assert!(rules.is_excluded("a.tmp"));
        assert!(rules.is_excluded("x/y/a.tmp"));
    }

    #[test]
    fn test_negation_later_wins() {
        let rules = IgnoreRules::parse("*.md\n!README.md\n").unwrap();
        assert!(rules.is_excluded("CHANGES.md"));
        assert!(!rules.is_excluded("README.md"));
        assert!(rules.has_negations());

        let rules = IgnoreRules::parse("!README.md\n*.md\n").unwrap();
        assert!(rules.is_excluded("README.md"));
    }

    #[test]
    fn test_leading_slash_and_comments() {
        let rules = IgnoreRules::parse("# build output\n/target\n\n./dist/\n").unwrap();
        assert!(rules.is_excluded("target/debug/app"));
        assert!(rules.is_excluded("dist"));
        assert!(!rules.is_excluded("src/main.rs"));
    }

    #[test]
    fn test_invalid_pattern_is_context_error() {
        let err = IgnoreRules::parse("[unclosed\n").unwrap_err();
        assert!(matches!(err, BuildError::ContextError(_)));
    }

    #[test]
    fn test_root_never_excluded() {
        let rules = IgnoreRules::parse("*\n").unwrap();
        assert!(!rules.is_excluded(""));
        assert!(rules.is_excluded("anything"));
    }
}
