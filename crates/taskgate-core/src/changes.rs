//! Change report intake - what an external execution actually touched.

use std::collections::BTreeSet;
use std::path::Path;

use git2::{Repository, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compliance::normalize_path;

#[derive(Debug, Error)]
pub enum ChangeReportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed change report {path}: {message}")]
    Malformed { path: String, message: String },

    #[error("git status failed: {0}")]
    Git(#[from] git2::Error),
}

/// Paths changed by a run, normalized, deduplicated and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeReport {
    pub changed_paths: Vec<String>,
}

impl ChangeReport {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = paths
            .into_iter()
            .map(|p| normalize_path(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            changed_paths: set.into_iter().collect(),
        }
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: ChangeReport) {
        let merged = std::mem::take(&mut self.changed_paths)
            .into_iter()
            .chain(other.changed_paths);
        *self = Self::new(merged);
    }

    /// Read a `{"changed_paths": [...]}` document.
    pub fn load(path: &Path) -> Result<Self, ChangeReportError> {
        let content = std::fs::read_to_string(path).map_err(|source| ChangeReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: ChangeReport =
            serde_json::from_str(&content).map_err(|e| ChangeReportError::Malformed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::new(raw.changed_paths))
    }

    /// Collect every non-ignored change in a git worktree, untracked included.
    pub fn from_git_worktree(worktree: &Path) -> Result<Self, ChangeReportError> {
        let repo = Repository::open(worktree)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .include_unmodified(false)
            // A rename is reported as its old and new path, both gated.
            .renames_head_to_index(false)
            .renames_index_to_workdir(false);

        let statuses = repo.statuses(Some(&mut opts))?;
        let mut paths = Vec::new();
        for entry in statuses.iter() {
            let status = entry.status();
            if status == Status::CURRENT || status.contains(Status::IGNORED) {
                continue;
            }
            paths.push(String::from_utf8_lossy(entry.path_bytes()).into_owned());
        }

        let report = Self::new(paths);
        tracing::info!(
            worktree = %worktree.display(),
            changed = report.changed_paths.len(),
            "Collected changes from git status"
        );
        Ok(report)
    }
}
