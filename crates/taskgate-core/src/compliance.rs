//! Compliance gate - checks changed paths against the declared allow-list.

use std::collections::BTreeSet;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::artifacts::{canonical_json_bytes, sha256_hex};

// `*` crosses directory separators, matching the allow-list glob dialect.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled allow-list pattern.
#[derive(Debug, Clone)]
pub struct AllowPattern {
    source: String,
    pattern: Pattern,
}

impl AllowPattern {
    /// Compile a pattern, rejecting anything that could escape the worktree.
    pub fn parse(source: &str) -> Result<Self, String> {
        if source.trim().is_empty() {
            return Err("pattern must not be blank".to_string());
        }
        if source.starts_with('/') || source.contains('\\') {
            return Err("pattern must be a relative '/'-separated path".to_string());
        }
        if source.split('/').any(|part| part == "..") {
            return Err("pattern must not contain '..' components".to_string());
        }
        let pattern =
            Pattern::new(&collapse_stars(source)).map_err(|e| format!("invalid glob: {}", e.msg))?;
        Ok(Self {
            source: source.to_string(),
            pattern,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }
}

/// Collapse runs of `*` so `src/**.py` reads as `src/*.py`.
fn collapse_stars(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut prev_star = false;
    for c in source.chars() {
        if c == '*' && prev_star {
            continue;
        }
        prev_star = c == '*';
        out.push(c);
    }
    out
}

/// Normalize a reported path: forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

/// True when a normalized path names a file inside the worktree.
///
/// Absolute paths, drive prefixes and `.`, `..` or empty components never
/// reach pattern matching: `src/../secrets/key.py` would otherwise match `src/**`.
pub fn is_worktree_relative(path: &str) -> bool {
    if path.starts_with('/') || path.as_bytes().get(1) == Some(&b':') {
        return false;
    }
    path.split('/')
        .all(|part| !part.is_empty() && part != "." && part != "..")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: String,
    pub message: String,
    pub paths: Vec<String>,
}

/// Outcome of comparing changed paths against the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub run_id: String,
    pub status: ComplianceStatus,
    pub declared_patterns: Vec<String>,
    pub changed_paths: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub unauthorized_paths: Vec<String>,
    pub violations: Vec<Violation>,
    /// Hash of the canonical `{changed_paths, declared_patterns}` pair
    pub diff_hash: String,
}

impl ComplianceReport {
    pub fn passed(&self) -> bool {
        self.status == ComplianceStatus::Pass
    }
}

/// Allow-list gate for one run.
#[derive(Debug, Clone)]
pub struct ComplianceGate {
    patterns: Vec<AllowPattern>,
}

impl ComplianceGate {
    /// Compile the declared allow-list.
    pub fn new(declared: &[String]) -> Result<Self, String> {
        let patterns = declared
            .iter()
            .map(|p| AllowPattern::parse(p).map_err(|e| format!("{p}: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_authorized(&self, path: &str) -> bool {
        is_worktree_relative(path) && self.patterns.iter().any(|p| p.matches(path))
    }

    /// Classify every changed path. Pass requires zero unauthorized paths.
    pub fn check(&self, run_id: &str, changed_paths: &[String]) -> ComplianceReport {
        let changed: BTreeSet<String> = changed_paths
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty())
            .collect();

        let (allowed, unauthorized): (Vec<String>, Vec<String>) =
            changed.iter().cloned().partition(|p| self.is_authorized(p));

        let declared: Vec<String> = self.patterns.iter().map(|p| p.source.clone()).collect();
        let changed: Vec<String> = changed.into_iter().collect();
        let diff_hash = sha256_hex(&canonical_json_bytes(&json!({
            "changed_paths": changed,
            "declared_patterns": declared,
        })));

        let status = if unauthorized.is_empty() {
            ComplianceStatus::Pass
        } else {
            ComplianceStatus::Fail
        };

        let (escaping, unmatched): (Vec<String>, Vec<String>) = unauthorized
            .iter()
            .cloned()
            .partition(|p| !is_worktree_relative(p));

        let mut violations = Vec::new();
        if !escaping.is_empty() {
            violations.push(Violation {
                kind: "path_escape".to_string(),
                message: format!(
                    "{} changed path(s) are not plain worktree-relative paths",
                    escaping.len()
                ),
                paths: escaping,
            });
        }
        if !unmatched.is_empty() {
            violations.push(Violation {
                kind: "allowlist_violation".to_string(),
                message: format!(
                    "{} changed path(s) match no declared allow-list pattern",
                    unmatched.len()
                ),
                paths: unmatched,
            });
        }

        tracing::info!(
            run_id = %run_id,
            status = ?status,
            changed = changed.len(),
            unauthorized = unauthorized.len(),
            "Compliance checked"
        );

        ComplianceReport {
            run_id: run_id.to_string(),
            status,
            declared_patterns: declared,
            changed_paths: changed,
            allowed_paths: allowed,
            unauthorized_paths: unauthorized,
            violations,
            diff_hash,
        }
    }
}

/// One-shot check of `changed_paths` against `declared_allowlist`.
pub fn check(
    run_id: &str,
    changed_paths: &[String],
    declared_allowlist: &[String],
) -> Result<ComplianceReport, String> {
    Ok(ComplianceGate::new(declared_allowlist)?.check(run_id, changed_paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unmatched_path_fails_the_gate() {
        let report = check(
            "run-1",
            &strings(&["src/a.py", "docs/b.md"]),
            &strings(&["src/**.py"]),
        )
        .unwrap();
        assert!(!report.passed());
        assert_eq!(report.unauthorized_paths, strings(&["docs/b.md"]));
        assert_eq!(report.allowed_paths, strings(&["src/a.py"]));
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, "allowlist_violation");
    }

    #[test]
    fn all_matched_paths_pass() {
        let report = check(
            "run-1",
            &strings(&["src/a.py", "src/pkg/deep/b.py"]),
            &strings(&["src/**.py"]),
        )
        .unwrap();
        assert!(report.passed());
        assert!(report.unauthorized_paths.is_empty());
        assert!(report.violations.is_empty());
    }

    #[test]
    fn empty_allowlist_authorizes_nothing() {
        let report = check("run-1", &strings(&["README.md"]), &[]).unwrap();
        assert!(!report.passed());
    }

    #[test]
    fn no_changes_pass() {
        let report = check("run-1", &[], &strings(&["src/*"])).unwrap();
        assert!(report.passed());
    }

    #[test]
    fn paths_are_normalized_and_deduplicated() {
        let report = check(
            "run-1",
            &strings(&["./src/a.py", "src/a.py", "src\\b.py"]),
            &strings(&["src/*"]),
        )
        .unwrap();
        assert_eq!(report.changed_paths, strings(&["src/a.py", "src/b.py"]));
    }

    #[test]
    fn question_mark_and_classes_follow_glob_rules() {
        let gate = ComplianceGate::new(&strings(&["lib/mod?.rs", "cfg/[ab].toml"])).unwrap();
        assert!(gate.is_authorized("lib/mod1.rs"));
        assert!(!gate.is_authorized("lib/mod10.rs"));
        assert!(gate.is_authorized("cfg/a.toml"));
        assert!(!gate.is_authorized("cfg/c.toml"));
    }

    #[test]
    fn escaping_patterns_are_rejected() {
        assert!(AllowPattern::parse("/etc/*").is_err());
        assert!(AllowPattern::parse("src/../../x").is_err());
        assert!(AllowPattern::parse("  ").is_err());
        assert!(AllowPattern::parse("src/[").is_err());
    }

    #[test]
    fn dot_dot_paths_are_never_authorized() {
        let report = check(
            "r",
            &strings(&["src/../secrets/key.py", "src/ok.py"]),
            &strings(&["src/**.py"]),
        )
        .unwrap();
        assert!(!report.passed());
        assert_eq!(report.unauthorized_paths, strings(&["src/../secrets/key.py"]));
        assert_eq!(report.allowed_paths, strings(&["src/ok.py"]));
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, "path_escape");
    }

    #[test]
    fn absolute_and_hollow_paths_are_never_authorized() {
        let gate = ComplianceGate::new(&strings(&["**"])).unwrap();
        assert!(gate.is_authorized("src/lib.rs"));
        assert!(!gate.is_authorized("/etc/passwd"));
        assert!(!gate.is_authorized("C:/Windows/win.ini"));
        assert!(!gate.is_authorized("src//lib.rs"));
        assert!(!gate.is_authorized("src/./lib.rs"));
        assert!(!gate.is_authorized("src/"));
    }

    #[test]
    fn diff_hash_is_stable_and_input_sensitive() {
        let a = check("r", &strings(&["src/a.py"]), &strings(&["src/*"])).unwrap();
        let b = check("r", &strings(&["src/a.py"]), &strings(&["src/*"])).unwrap();
        let c = check("r", &strings(&["src/b.py"]), &strings(&["src/*"])).unwrap();
        assert_eq!(a.diff_hash, b.diff_hash);
        assert_ne!(a.diff_hash, c.diff_hash);
    }
}
