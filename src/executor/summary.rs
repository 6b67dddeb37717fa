//! Per-node work summaries: what a node's commits changed.
//!
//! Computed after a node succeeds, from the git history between two
//! commits. Leaves additionally get an aggregated summary from the plan
//! base to their completed commit — everything the merge brings to the
//! target branch.

use std::fmt;
use std::path::Path;

use convoy_git::{DiffStatus, GitError, GitGateway, GitOid};

/// One commit line in a summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitLine {
    /// Abbreviated hash.
    pub short_id: String,
    /// First line of the message.
    pub summary: String,
}

/// What a range of commits changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkSummary {
    /// Number of commits in the range.
    pub commit_count: usize,
    /// Files added.
    pub files_added: usize,
    /// Files modified.
    pub files_modified: usize,
    /// Files deleted.
    pub files_deleted: usize,
    /// The commits, oldest first.
    pub commits: Vec<CommitLine>,
}

impl fmt::Display for WorkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commit(s), +{} ~{} -{} file(s)",
            self.commit_count, self.files_added, self.files_modified, self.files_deleted
        )?;
        for commit in &self.commits {
            write!(f, "\n  {} {}", commit.short_id, commit.summary)?;
        }
        Ok(())
    }
}

/// Summarize the commits reachable from `to` but not `from`.
///
/// An empty range (node carried its base forward) yields the zero
/// summary.
pub fn compute_work_summary(
    git: &dyn GitGateway,
    repo: &Path,
    from: GitOid,
    to: GitOid,
) -> Result<WorkSummary, GitError> {
    if from == to {
        return Ok(WorkSummary::default());
    }
    let commits = git.list_commits(repo, Some(from), to)?;
    let entries = git.diff_entries(repo, from, to)?;
    let mut summary = WorkSummary {
        commit_count: commits.len(),
        ..WorkSummary::default()
    };
    for entry in entries {
        match entry.status {
            DiffStatus::Added => summary.files_added += 1,
            DiffStatus::Deleted => summary.files_deleted += 1,
            DiffStatus::Modified => summary.files_modified += 1,
        }
    }
    summary.commits = commits
        .into_iter()
        .map(|c| CommitLine {
            short_id: c.short_id,
            summary: c.summary,
        })
        .collect();
    Ok(summary)
}
