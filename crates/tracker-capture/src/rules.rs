use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::textfile::safe_is_text_file;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid rule type {0:?}: expected one of text, binary, dir")]
    InvalidType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Text,
    Binary,
    Dir,
}

impl FromStr for RuleType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, RuleError> {
        match s {
            "text" => Ok(RuleType::Text),
            "binary" => Ok(RuleType::Binary),
            "dir" => Ok(RuleType::Dir),
            other => Err(RuleError::InvalidType(other.to_string())),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::Text => "text",
            RuleType::Binary => "binary",
            RuleType::Dir => "dir",
        };
        f.write_str(s)
    }
}

/// One entry in an ordered selection rule list.
///
/// `test` returns `Some(result)` when the rule applies to a path and
/// `None` when it does not. Applicability requires the pattern to
/// match, any type and size constraints to hold, and the match cap
/// not yet to be reached. Each application counts against the cap.
#[derive(Debug)]
pub struct FileSelectRule {
    result: bool,
    patterns: Vec<String>,
    compiled: Vec<Regex>,
    rule_type: Option<RuleType>,
    sentinel: Option<String>,
    size_gt: Option<u64>,
    size_lt: Option<u64>,
    max_matches: Option<usize>,
    matches: usize,
}

/// Rule selecting paths that match.
pub fn include(patterns: &[&str]) -> FileSelectRule {
    FileSelectRule::new(true, patterns)
}

/// Rule deselecting paths that match.
pub fn exclude(patterns: &[&str]) -> FileSelectRule {
    FileSelectRule::new(false, patterns)
}

/// Like [`include`] but with patterns taken as regular expressions
/// anchored at the start of the relative path.
pub fn include_regex(patterns: &[&str]) -> Result<FileSelectRule, RuleError> {
    FileSelectRule::new_regex(true, patterns)
}

/// Like [`exclude`] but with regular expression patterns.
pub fn exclude_regex(patterns: &[&str]) -> Result<FileSelectRule, RuleError> {
    FileSelectRule::new_regex(false, patterns)
}

impl FileSelectRule {
    fn new(result: bool, patterns: &[&str]) -> Self {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let compiled = patterns
            .iter()
            .map(|p| glob_regex(p))
            .collect();
        Self {
            result,
            patterns,
            compiled,
            rule_type: None,
            sentinel: None,
            size_gt: None,
            size_lt: None,
            max_matches: None,
            matches: 0,
        }
    }

    fn new_regex(result: bool, patterns: &[&str]) -> Result<Self, RuleError> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!(r"\A(?:{})", p)).map_err(|source| {
                    RuleError::InvalidPattern {
                        pattern: p.to_string(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            result,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            compiled,
            rule_type: None,
            sentinel: None,
            size_gt: None,
            size_lt: None,
            max_matches: None,
            matches: 0,
        })
    }

    pub fn with_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = Some(rule_type);
        self
    }

    pub fn with_sentinel(mut self, sentinel: &str) -> Self {
        self.sentinel = Some(sentinel.to_string());
        self
    }

    pub fn size_gt(mut self, size: u64) -> Self {
        self.size_gt = Some(size);
        self
    }

    pub fn size_lt(mut self, size: u64) -> Self {
        self.size_lt = Some(size);
        self
    }

    pub fn max_matches(mut self, n: usize) -> Self {
        self.max_matches = Some(n);
        self
    }

    pub fn is_include(&self) -> bool {
        self.result
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn rule_type(&self) -> Option<RuleType> {
        self.rule_type
    }

    pub fn matches(&self) -> usize {
        self.matches
    }

    pub fn reset_matches(&mut self) {
        self.matches = 0;
    }

    pub fn test(&mut self, src_root: &Path, relpath: &Path) -> Option<bool> {
        let fullpath = src_root.join(relpath);
        if !self.test_max_matches()
            || !self.test_patterns(relpath)
            || !self.test_type(&fullpath)
            || !self.test_size(&fullpath)
        {
            return None;
        }
        self.matches += 1;
        Some(self.result)
    }

    fn test_max_matches(&self) -> bool {
        match self.max_matches {
            Some(cap) => self.matches < cap,
            None => true,
        }
    }

    fn test_patterns(&self, relpath: &Path) -> bool {
        let path = relpath.to_string_lossy();
        self.compiled.iter().any(|re| re.is_match(&path))
    }

    fn test_type(&self, path: &Path) -> bool {
        match self.rule_type {
            None => true,
            Some(RuleType::Text) => safe_is_text_file(path),
            Some(RuleType::Binary) => !safe_is_text_file(path),
            Some(RuleType::Dir) => self.test_dir(path),
        }
    }

    fn test_dir(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        match &self.sentinel {
            Some(sentinel) => path.join(sentinel).exists(),
            None => true,
        }
    }

    fn test_size(&self, path: &Path) -> bool {
        if self.size_gt.is_none() && self.size_lt.is_none() {
            return true;
        }
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            // Unreadable size never disqualifies on its own.
            Err(_) => return true,
        };
        if matches!(self.size_gt, Some(gt) if size > gt) {
            return true;
        }
        if matches!(self.size_lt, Some(lt) if size < lt) {
            return true;
        }
        false
    }
}

/// Ordered rule list with the last-applicable-rule-wins policy.
#[derive(Debug)]
pub struct FileSelect {
    rules: Vec<FileSelectRule>,
}

impl FileSelect {
    pub fn new(rules: Vec<FileSelectRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FileSelectRule] {
        &self.rules
    }

    pub fn reset_matches(&mut self) {
        for rule in &mut self.rules {
            rule.reset_matches();
        }
    }

    /// True when the file at `relpath` under `src_root` is selected.
    ///
    /// Directory rules do not participate; they apply only when
    /// pruning. A file no rule applies to is not selected.
    pub fn select_file(&mut self, src_root: &Path, relpath: &Path) -> bool {
        let mut last = None;
        for rule in &mut self.rules {
            if rule.rule_type == Some(RuleType::Dir) {
                continue;
            }
            if let Some(result) = rule.test(src_root, relpath) {
                last = Some(result);
            }
        }
        last == Some(true)
    }

    /// True when the directory at `relpath` should be skipped
    /// entirely. Only directory rules apply here; an excluding dir
    /// rule as the last applicable one prunes the subtree.
    pub fn prune_dir(&mut self, src_root: &Path, relpath: &Path) -> bool {
        let mut last = None;
        for rule in &mut self.rules {
            if rule.rule_type != Some(RuleType::Dir) {
                continue;
            }
            if let Some(result) = rule.test(src_root, relpath) {
                last = Some(result);
            }
        }
        last == Some(false)
    }
}

/// Translates a shell-style glob into an anchored regex. `*` matches
/// any run of characters (including separators), `?` a single
/// character, and `[...]` a character class with `!` negation. The
/// translation always yields a valid expression; literal characters
/// are escaped.
fn glob_regex(pattern: &str) -> Regex {
    let mut out = String::from(r"\A(?s:");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|off| i + 1 + off);
                match close {
                    // Non-empty class up to the closing bracket.
                    Some(close) if close > i + 1 || chars.get(i + 1) == Some(&'!') => {
                        out.push('[');
                        let mut j = i + 1;
                        if chars[j] == '!' {
                            out.push('^');
                            j += 1;
                        }
                        while j < close {
                            let c = chars[j];
                            if c == '\\' || c == '^' || c == '[' || c == '&' || c == '~' {
                                out.push('\\');
                            }
                            out.push(c);
                            j += 1;
                        }
                        out.push(']');
                        i = close;
                    }
                    _ => out.push_str(r"\["),
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push_str(r")\z");
    Regex::new(&out).unwrap_or_else(|_| {
        // Unreachable for well-formed translations; fall back to the
        // fully escaped literal.
        Regex::new(&format!(r"\A{}\z", regex::escape(pattern))).unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn matches(pattern: &str, path: &str) -> bool {
        glob_regex(pattern).is_match(path)
    }

    #[test]
    fn glob_star_crosses_separators() {
        assert!(matches("*", "a/b/c.py"));
        assert!(matches("*.py", "models/net.py"));
        assert!(!matches("*.py", "net.pyc"));
    }

    #[test]
    fn glob_question_and_class() {
        assert!(matches("a?c", "abc"));
        assert!(!matches("a?c", "ac"));
        assert!(matches("[ab].txt", "a.txt"));
        assert!(!matches("[!ab].txt", "a.txt"));
        assert!(matches("[!ab].txt", "c.txt"));
    }

    #[test]
    fn glob_literal_dots_are_escaped() {
        assert!(matches(".*", ".git"));
        assert!(!matches(".*", "git"));
    }

    #[test]
    fn unterminated_class_is_literal() {
        assert!(matches("a[b", "a[b"));
        assert!(!matches("a[b", "ab"));
    }

    #[test]
    fn bad_regex_pattern_is_an_error() {
        match include_regex(&["("]) {
            Err(RuleError::InvalidPattern { pattern, .. }) => assert_eq!(pattern, "("),
            other => panic!("expected InvalidPattern, got {:?}", other),
        }
    }

    #[test]
    fn last_applicable_rule_wins() {
        let root = PathBuf::from("/nonexistent");
        let mut select = FileSelect::new(vec![
            include(&["*"]),
            exclude(&["*.log"]),
            include(&["keep.log"]),
        ]);
        assert!(select.select_file(&root, Path::new("main.py")));
        assert!(!select.select_file(&root, Path::new("debug.log")));
        assert!(select.select_file(&root, Path::new("keep.log")));
    }

    #[test]
    fn unmatched_file_is_not_selected() {
        let root = PathBuf::from("/nonexistent");
        let mut select = FileSelect::new(vec![include(&["*.py"])]);
        assert!(!select.select_file(&root, Path::new("notes.txt")));
    }

    #[test]
    fn match_cap_renders_rule_inapplicable() {
        let root = PathBuf::from("/nonexistent");
        let mut rule = include(&["*"]).max_matches(1);
        assert_eq!(rule.test(&root, Path::new("a")), Some(true));
        assert_eq!(rule.test(&root, Path::new("b")), None);
        rule.reset_matches();
        assert_eq!(rule.test(&root, Path::new("b")), Some(true));
    }

    #[test]
    fn size_window_with_unknown_size_passes() {
        let root = PathBuf::from("/nonexistent");
        let mut rule = include(&["*"]).size_lt(100);
        // Metadata is unreadable under a nonexistent root.
        assert_eq!(rule.test(&root, Path::new("ghost.txt")), Some(true));
    }
}
