//! Path patterns: grammar validation, glob matching and precedence
//!
//! Patterns are absolute paths, optionally ending in `/*`, `/**`,
//! `/**/*.ext` or `/*.ext`. Matching follows doublestar semantics: `*`
//! stays within one path segment while `**` crosses segments.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use globset::GlobBuilder;
use regex::Regex;

use crate::core::{AccessRuleError, RuleResult};

static PATH_PATTERN_GRAMMAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(/|(/[^/*{}]+)*(/\*|(/\*\*)?(/\*\.[^/*{}]+)?)?)$").ok());

/// Check that `pattern` follows the allowed path pattern grammar
pub fn validate_path_pattern(pattern: &str) -> RuleResult<()> {
    let valid = !pattern.is_empty()
        && PATH_PATTERN_GRAMMAR
            .as_ref()
            .is_some_and(|grammar| grammar.is_match(pattern));
    if valid {
        Ok(())
    } else {
        Err(AccessRuleError::InvalidPathPattern(pattern.to_string()))
    }
}

/// Boolean glob match of a concrete path against a pattern
pub trait PatternMatcher: Send + Sync {
    /// Returns true if `path` is matched by `pattern`
    fn matches(&self, pattern: &str, path: &str) -> bool;
}

/// Implement PatternMatcher for closures
impl<F> PatternMatcher for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn matches(&self, pattern: &str, path: &str) -> bool {
        (self)(pattern, path)
    }
}

/// Default matcher backed by `globset`.
///
/// Compiled globs are cached per pattern; a pattern which fails to compile
/// is cached as never matching.
#[derive(Debug, Default)]
pub struct GlobMatcher {
    compiled: RwLock<HashMap<String, Option<globset::GlobMatcher>>>,
}

impl GlobMatcher {
    /// Create a matcher with an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(pattern: &str) -> Option<globset::GlobMatcher> {
        match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(e) => {
                tracing::warn!("Cannot compile path pattern {}: {}", pattern, e);
                None
            }
        }
    }

    fn glob_matches(&self, pattern: &str, path: &str) -> bool {
        if let Ok(cache) = self.compiled.read() {
            if let Some(compiled) = cache.get(pattern) {
                return compiled.as_ref().is_some_and(|glob| glob.is_match(path));
            }
        }
        let compiled = Self::compile(pattern);
        let matched = compiled.as_ref().is_some_and(|glob| glob.is_match(path));
        if let Ok(mut cache) = self.compiled.write() {
            cache.insert(pattern.to_string(), compiled);
        }
        matched
    }
}

impl PatternMatcher for GlobMatcher {
    fn matches(&self, pattern: &str, path: &str) -> bool {
        // A trailing /** also covers the directory itself
        if let Some(dir) = pattern.strip_suffix("/**") {
            let dir = if dir.is_empty() { "/" } else { dir };
            if path == dir {
                return true;
            }
        }
        self.glob_matches(pattern, path)
    }
}

/// Select the most specific of several patterns matching the same path.
///
/// Precedence, highest first:
/// 1. a pattern without wildcards (exact match)
/// 2. patterns ending in `*.<ext>` with the longest extension
/// 3. the deepest literal prefix once `/**` and `/*` are stripped
/// 4. the shortest pattern, so `/foo` beats `/foo/*` beats `/foo/**`
pub fn highest_precedence_pattern<S: AsRef<str>>(patterns: &[S]) -> RuleResult<&str> {
    if patterns.is_empty() {
        return Err(AccessRuleError::NoPatterns);
    }
    let mut candidates: Vec<&str> = patterns.iter().map(AsRef::as_ref).collect();

    if let Some(exact) = candidates.iter().copied().find(|p| !p.contains('*')) {
        return Ok(exact);
    }

    // Longer extensions are more specific than longer paths, so
    // /foo/bar/**/*.tar.gz beats /foo/bar/baz/**/*.gz
    let mut longest_extension = 0;
    let mut with_extension: Vec<&str> = Vec::new();
    for pattern in &candidates {
        let Some(extension) = extension_of(pattern) else {
            continue;
        };
        if extension.len() > longest_extension {
            longest_extension = extension.len();
            with_extension.clear();
        }
        if extension.len() == longest_extension {
            with_extension.push(*pattern);
        }
    }
    if !with_extension.is_empty() {
        candidates = with_extension;
    }

    let longest_cleaned = candidates
        .iter()
        .map(|p| cleaned_length(p))
        .max()
        .unwrap_or(0);
    candidates.retain(|p| cleaned_length(p) == longest_cleaned);

    candidates
        .into_iter()
        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .ok_or(AccessRuleError::NoPatterns)
}

/// Extension of a final `*.<ext>` segment, if there is one
fn extension_of(pattern: &str) -> Option<&str> {
    let final_segment = pattern.rsplit('/').next()?;
    final_segment.strip_prefix("*.")
}

/// Length of the pattern with `/**` and `/*` removed
fn cleaned_length(pattern: &str) -> usize {
    pattern.replace("/**", "").replace("/*", "").len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_patterns() {
        for pattern in [
            "/",
            "/home/test/Downloads",
            "/home/test/Downloads/*",
            "/home/test/Downloads/**",
            "/home/test/Downloads/*.pdf",
            "/home/test/Downloads/**/*.tar.gz",
            "/**",
            "/home/test/.config/app",
        ] {
            assert!(validate_path_pattern(pattern).is_ok(), "{pattern} should be valid");
        }
    }

    #[test]
    fn test_invalid_patterns() {
        for pattern in [
            "",
            "home/test",
            "/home/*/Downloads",
            "/home/test/**/Downloads",
            "/home/test/{a,b}",
            "/home/test/file*",
            "/home/test/***",
            "/home/test//*",
            "/home/test/*/*.txt",
        ] {
            assert!(
                matches!(validate_path_pattern(pattern), Err(AccessRuleError::InvalidPathPattern(_))),
                "{pattern} should be invalid"
            );
        }
    }

    #[test]
    fn test_glob_matcher() {
        let m = GlobMatcher::new();
        assert!(m.matches("/home/test/Downloads/**", "/home/test/Downloads/a/b/c.txt"));
        assert!(m.matches("/home/test/Downloads/*", "/home/test/Downloads/c.txt"));
        assert!(!m.matches("/home/test/Downloads/*", "/home/test/Downloads/a/c.txt"));
        assert!(m.matches("/home/test/Downloads/*.exe", "/home/test/Downloads/virus.exe"));
        assert!(!m.matches("/home/test/Downloads/*.exe", "/home/test/Downloads/readme.txt"));
        assert!(m.matches("/foo/**/*.gz", "/foo/a/b/x.tar.gz"));
        assert!(m.matches("/foo/**/*.gz", "/foo/x.gz"));
        assert!(m.matches("/foo/bar", "/foo/bar"));
        assert!(!m.matches("/foo/bar", "/foo/bar/baz"));
    }

    #[test]
    fn test_recursive_pattern_matches_its_directory() {
        let m = GlobMatcher::new();
        assert!(m.matches("/foo/**", "/foo"));
        assert!(m.matches("/home/u/Downloads/**", "/home/u/Downloads"));
        assert!(m.matches("/**", "/"));
        assert!(m.matches("/**", "/etc/passwd"));
        assert!(!m.matches("/foo/**", "/foobar"));
        assert!(!m.matches("/foo/*", "/foo"));
        assert!(!m.matches("/foo/**/*.txt", "/foo"));
    }

    #[test]
    fn test_glob_matcher_caches_compiled_patterns() {
        let m = GlobMatcher::new();
        assert!(m.matches("/a/*.pdf", "/a/x.pdf"));
        assert!(!m.matches("/a/*.pdf", "/a/x.txt"));
        assert!(m.matches("/b/**", "/b/c/d"));
        assert_eq!(m.compiled.read().unwrap().len(), 2);

        // Unparsable globs are remembered as never matching
        assert!(!m.matches("/a/[", "/a/["));
        assert!(!m.matches("/a/[", "/a/["));
        assert_eq!(m.compiled.read().unwrap().len(), 3);
    }

    #[test]
    fn test_closure_matcher() {
        let m = |pattern: &str, path: &str| pattern == path;
        assert!(m.matches("/a", "/a"));
        assert!(!PatternMatcher::matches(&m, "/a", "/b"));
    }

    #[test]
    fn test_precedence_empty() {
        let empty: Vec<String> = Vec::new();
        assert!(matches!(highest_precedence_pattern(&empty), Err(AccessRuleError::NoPatterns)));
    }

    #[test]
    fn test_precedence_exact_beats_glob() {
        let patterns = ["/foo/*", "/foo/bar", "/foo/**"];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/foo/bar");
    }

    #[test]
    fn test_precedence_longer_extension_wins() {
        let patterns = ["/foo/**/*.gz", "/foo/**/*.tar.gz"];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/foo/**/*.tar.gz");

        let patterns = ["/foo/bar/baz/**/*.gz", "/foo/bar/**/*.tar.gz"];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/foo/bar/**/*.tar.gz");
    }

    #[test]
    fn test_precedence_extension_beats_directory() {
        let patterns = ["/home/test/Downloads/**", "/home/test/Downloads/*.exe"];
        assert_eq!(
            highest_precedence_pattern(&patterns).unwrap(),
            "/home/test/Downloads/*.exe"
        );
    }

    #[test]
    fn test_precedence_deeper_directory_wins() {
        let patterns = ["/foo/**", "/foo/bar/**", "/foo/bar/baz/*"];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/foo/bar/baz/*");
    }

    #[test]
    fn test_precedence_single_level_beats_recursive() {
        let patterns = ["/foo/bar/**", "/foo/bar/*"];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/foo/bar/*");

        let patterns = ["/foo/**/*.txt", "/foo/*.txt"];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/foo/*.txt");
    }

    #[test]
    fn test_precedence_accepts_owned_strings() {
        let patterns = vec!["/a/**".to_string(), "/a/b/**".to_string()];
        assert_eq!(highest_precedence_pattern(&patterns).unwrap(), "/a/b/**");
    }
}
