//! The [`GitGateway`] trait — the single abstraction boundary between the
//! orchestrator and git.
//!
//! The orchestrator interacts with git exclusively through this trait. The
//! trait is object-safe so callers can hold a `Box<dyn GitGateway>` or
//! `Arc<dyn GitGateway>` and swap in a test double.
//!
//! Every method takes the repository (or worktree) path explicitly: one
//! gateway instance serves every repository the process touches, and the
//! reverse-integration mutex in the orchestrator is what serializes
//! operations that contend on a single repository's index lock.

use std::path::Path;

use crate::error::GitError;
use crate::types::{CommitInfo, DiffEntry, GitOid, MergeOutcome, MergeTreeOutcome, WorktreeCreation};

/// The git abstraction used by the orchestrator.
///
/// Implementations may be backed by the git CLI (the default), a library,
/// or a test double.
///
/// # Object safety
///
/// No generic methods, no `Self` in return position outside of `Result`.
pub trait GitGateway: Send + Sync {
    // -----------------------------------------------------------------------
    // Worktrees
    //
    // Replaces: git worktree add --detach, git worktree remove
    // -----------------------------------------------------------------------

    /// Create a detached worktree at `path`, or reuse the one already there.
    ///
    /// A fresh worktree is checked out detached at `base_commitish`. If a
    /// worktree already exists at `path` it is left untouched and its
    /// current HEAD is reported back with `reused = true` — callers that
    /// must preserve the original base commit across retries keep their own
    /// record and ignore the reported HEAD on reuse.
    fn create_or_reuse_detached(
        &self,
        repo: &Path,
        path: &Path,
        base_commitish: &str,
    ) -> Result<WorktreeCreation, GitError>;

    /// Remove a worktree and prune its administrative entry.
    ///
    /// Missing worktrees are a no-op, and removal is forced (uncommitted
    /// changes in the worktree do not block it).
    fn remove_worktree_safe(&self, repo: &Path, path: &Path) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Refs and revisions
    //
    // Replaces: git rev-parse, git update-ref, git symbolic-ref
    // -----------------------------------------------------------------------

    /// Resolve `HEAD` of the repository (or worktree) at `cwd`.
    fn head_commit(&self, cwd: &Path) -> Result<GitOid, GitError>;

    /// Resolve any commitish to an OID, `None` when it does not resolve.
    fn resolve_ref(&self, cwd: &Path, refish: &str) -> Result<Option<GitOid>, GitError>;

    /// The currently checked-out branch, `None` when HEAD is detached.
    fn current_branch(&self, cwd: &Path) -> Result<Option<String>, GitError>;

    /// Point `ref_name` at `new`, optionally with compare-and-swap
    /// semantics against `expected_old`.
    ///
    /// Returns [`GitError::RefLocked`] on lock contention (retryable) and
    /// [`GitError::RefConflict`] when the CAS expectation fails.
    fn update_ref(
        &self,
        repo: &Path,
        ref_name: &str,
        new: GitOid,
        expected_old: Option<GitOid>,
    ) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Working tree state
    //
    // Replaces: git status --porcelain, git checkout, git reset --hard,
    //           git clean, git diff
    // -----------------------------------------------------------------------

    /// Whether the working tree or index has uncommitted changes
    /// (untracked files count).
    fn has_uncommitted_changes(&self, cwd: &Path) -> Result<bool, GitError>;

    /// Check out a branch or commit in the working tree at `cwd`.
    fn checkout(&self, cwd: &Path, refish: &str) -> Result<(), GitError>;

    /// Hard-reset the working tree at `cwd` to `commit`.
    fn reset_hard(&self, cwd: &Path, commit: GitOid) -> Result<(), GitError>;

    /// Remove untracked files and directories from the working tree.
    fn clean_untracked(&self, cwd: &Path) -> Result<(), GitError>;

    /// The working-tree diff (tracked changes only) as a unified patch.
    fn working_diff(&self, cwd: &Path) -> Result<String, GitError>;

    // -----------------------------------------------------------------------
    // Stash
    //
    // Replaces: git stash push/pop/drop/show
    // -----------------------------------------------------------------------

    /// Stash working-tree changes (including untracked files).
    ///
    /// Returns `false` when there was nothing to stash.
    fn stash_push(&self, cwd: &Path, message: &str) -> Result<bool, GitError>;

    /// Pop the most recent stash entry.
    fn stash_pop(&self, cwd: &Path) -> Result<(), GitError>;

    /// Drop the most recent stash entry without applying it.
    fn stash_drop(&self, cwd: &Path) -> Result<(), GitError>;

    /// The most recent stash entry as a unified patch.
    fn stash_show_patch(&self, cwd: &Path) -> Result<String, GitError>;

    // -----------------------------------------------------------------------
    // Remote transfer
    //
    // Replaces: git fetch, git push
    // -----------------------------------------------------------------------

    /// Fetch from `remote`.
    fn fetch(&self, cwd: &Path, remote: &str) -> Result<(), GitError>;

    /// Push `branch` to `remote`.
    fn push(&self, cwd: &Path, remote: &str, branch: &str) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Merging
    //
    // Replaces: git merge, git merge --no-commit, git merge --abort,
    //           git merge-tree --write-tree, git commit-tree
    // -----------------------------------------------------------------------

    /// True merge of `source` into the working tree at `cwd`.
    ///
    /// A conflicted merge is reported in the outcome, not as an error; the
    /// index is left with conflict entries for a resolver to work on.
    fn merge(&self, cwd: &Path, source: GitOid, message: &str) -> Result<MergeOutcome, GitError>;

    /// Merge `source` into the working tree without committing, leaving
    /// the result staged (or conflicted) for inspection.
    fn merge_no_commit(&self, cwd: &Path, source: GitOid) -> Result<MergeOutcome, GitError>;

    /// Abort an in-progress merge, restoring the pre-merge working tree.
    fn abort_merge(&self, cwd: &Path) -> Result<(), GitError>;

    /// Merge two commits entirely in-memory, without touching any working
    /// tree or the index.
    fn merge_without_checkout(
        &self,
        repo: &Path,
        target: GitOid,
        source: GitOid,
    ) -> Result<MergeTreeOutcome, GitError>;

    /// Create a commit object from `tree` with the given parents.
    fn commit_tree(
        &self,
        repo: &Path,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
    ) -> Result<GitOid, GitError>;

    /// Stage everything in the working tree at `cwd` and commit.
    ///
    /// Returns the new commit, or `None` when there was nothing to commit.
    fn commit_all(&self, cwd: &Path, message: &str) -> Result<Option<GitOid>, GitError>;

    // -----------------------------------------------------------------------
    // History inspection
    //
    // Replaces: git log --format, git diff --name-status
    // -----------------------------------------------------------------------

    /// Commits reachable from `to` but not from `from`, oldest first.
    /// With `from = None`, the full history of `to` (bounded by the caller's
    /// good judgement).
    fn list_commits(
        &self,
        repo: &Path,
        from: Option<GitOid>,
        to: GitOid,
    ) -> Result<Vec<CommitInfo>, GitError>;

    /// Changed files between two commits.
    fn diff_entries(&self, repo: &Path, from: GitOid, to: GitOid)
        -> Result<Vec<DiffEntry>, GitError>;

    // -----------------------------------------------------------------------
    // Repository hygiene
    // -----------------------------------------------------------------------

    /// Ensure each entry appears in the repository's `.gitignore`.
    ///
    /// Returns `true` if the file was modified.
    fn ensure_gitignore_entries(&self, repo: &Path, entries: &[&str]) -> Result<bool, GitError>;
}
