//! Reverse integration: merge a leaf's completed commit into the plan's
//! target branch.
//!
//! Two strategies:
//!
//! 1. **Fast path** — merge the commits entirely in-memory
//!    (`merge-tree`), create a squash-style merge commit with the target
//!    tip as single parent, and move the branch pointer. No checkout, no
//!    index contention, safe while the user works on another branch.
//! 2. **Conflict path** — stash, check out the target branch, run a
//!    no-commit merge, delegate to the conflict resolver, then restore the
//!    user's branch and stash.
//!
//! Callers hold the reverse-integration mutex for the whole call.
//!
//! A stash failure after the merge commit exists is a *partial success*:
//! the commit is real, only the branch pointer (or the user's working
//! tree) needs manual attention. That is reported as an advisory, never
//! as a failure.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use convoy_git::{GitError, GitOid};

use crate::engine::Engine;
use crate::executor::forward::ORCHESTRATOR_IGNORE_ENTRIES;
use crate::logs::LogLevel;
use crate::model::types::{NodeId, PlanId};
use crate::model::{Metrics, Phase};
use crate::resolver::{ResolveRequest, ResolveOutcome};

/// Attempts for a contended branch-pointer update.
const UPDATE_REF_ATTEMPTS: u32 = 3;

/// The outcome of one reverse integration.
pub(crate) enum RiResult {
    /// The commit is on the target branch (possibly with an advisory about
    /// deferred working-tree restoration).
    Merged {
        /// Partial-success advisory for the user, when something
        /// non-fatal was left for them (stash kept, branch update
        /// deferred).
        advisory: Option<String>,
        /// Resolver metrics, when the conflict path ran.
        metrics: Metrics,
    },
    /// The merge failed; the completed commit is preserved for retry.
    Failed {
        /// What went wrong.
        error: String,
    },
}

/// Merge `completed` into `target_branch`. Callers hold the RI mutex.
#[allow(clippy::too_many_lines)]
pub(crate) fn reverse_integrate(
    engine: &Engine,
    plan_id: PlanId,
    node_id: &NodeId,
    attempt: u32,
    repo: &Path,
    target_branch: &str,
    completed: GitOid,
) -> RiResult {
    let log = |level: LogLevel, message: String| {
        engine
            .logs
            .append(plan_id, node_id, attempt, Some(Phase::MergeRi), level, message);
    };
    let target_ref = format!("refs/heads/{target_branch}");

    let tip = match engine.git.resolve_ref(repo, target_branch) {
        Ok(tip) => tip,
        Err(e) => {
            return RiResult::Failed {
                error: format!("could not resolve target branch '{target_branch}': {e}"),
            };
        }
    };
    let Some(tip) = tip else {
        // First merge into a branch that does not exist yet: the completed
        // commit becomes the branch.
        return match update_ref_with_retry(engine, repo, &target_ref, completed, None) {
            Ok(()) => {
                log(
                    LogLevel::Info,
                    format!("created '{target_branch}' at {}", completed.short()),
                );
                RiResult::Merged {
                    advisory: None,
                    metrics: Metrics::new(),
                }
            }
            Err(e) => RiResult::Failed {
                error: format!("could not create target branch: {e}"),
            },
        };
    };

    if tip == completed {
        return RiResult::Merged {
            advisory: None,
            metrics: Metrics::new(),
        };
    }

    let merge_tree = match engine.git.merge_without_checkout(repo, tip, completed) {
        Ok(outcome) => outcome,
        Err(e) => {
            return RiResult::Failed {
                error: format!("merge computation failed: {e}"),
            };
        }
    };

    let message = format!("{node_id}: merge into {target_branch}");
    if let Some(tree) = merge_tree.tree.filter(|_| merge_tree.is_clean()) {
        // Fast path: commit the merged tree with the tip as single parent
        // and move the pointer.
        let merged = match engine.git.commit_tree(repo, tree, &[tip], &message) {
            Ok(commit) => commit,
            Err(e) => {
                return RiResult::Failed {
                    error: format!("could not create merge commit: {e}"),
                };
            }
        };
        log(
            LogLevel::Info,
            format!("merged cleanly as {}", merged.short()),
        );
        let advisory = advance_target_branch(engine, repo, target_branch, &target_ref, tip, merged);
        match advisory {
            Ok(advisory) => {
                push_if_configured(engine, repo, target_branch);
                RiResult::Merged {
                    advisory,
                    metrics: Metrics::new(),
                }
            }
            Err(error) => RiResult::Failed { error },
        }
    } else {
        log(
            LogLevel::Warn,
            format!(
                "merge conflicts in {} file(s), taking the checkout path",
                merge_tree.conflict_files.len()
            ),
        );
        let outcome = conflict_path_merge(
            engine,
            plan_id,
            node_id,
            attempt,
            repo,
            target_branch,
            completed,
            &message,
            merge_tree.conflict_files,
        );
        if let RiResult::Merged { .. } = &outcome {
            push_if_configured(engine, repo, target_branch);
        }
        outcome
    }
}

/// Move the target branch to `merged`, respecting the user's checkout.
///
/// Returns an advisory when the merge stands but something was left for
/// the user; an `Err` means the pointer was not moved at all.
fn advance_target_branch(
    engine: &Engine,
    repo: &Path,
    target_branch: &str,
    target_ref: &str,
    tip: GitOid,
    merged: GitOid,
) -> Result<Option<String>, String> {
    let on_target = match engine.git.current_branch(repo) {
        Ok(current) => current.as_deref() == Some(target_branch),
        Err(e) => {
            warn!(error = %e, "could not determine current branch, using atomic ref update");
            false
        }
    };

    if !on_target {
        return update_ref_with_retry(engine, repo, target_ref, merged, Some(tip))
            .map(|()| None)
            .map_err(|e| format!("branch pointer update failed: {e}"));
    }

    // The user has the target branch checked out: the working tree has to
    // move with the pointer.
    let dirty = engine
        .git
        .has_uncommitted_changes(repo)
        .map_err(|e| format!("could not inspect working tree: {e}"))?;
    if !dirty {
        return engine
            .git
            .reset_hard(repo, merged)
            .map(|()| None)
            .map_err(|e| format!("could not advance checked-out target branch: {e}"));
    }

    let diff = engine.git.working_diff(repo).unwrap_or_default();
    if is_orchestrator_gitignore_only(&diff) {
        // Only our own ignore entries: discard rather than stash-cycle.
        return engine
            .git
            .reset_hard(repo, merged)
            .map(|()| None)
            .map_err(|e| format!("could not advance checked-out target branch: {e}"));
    }

    match engine.git.stash_push(repo, "convoy: hold changes for merge") {
        Err(e) => {
            // The merge commit exists; only the pointer move is deferred.
            warn!(error = %e, "stash failed, leaving branch pointer for manual update");
            Ok(Some(format!(
                "merge commit {} created, but your working tree could not be stashed; \
                 run `git reset --hard {}` on '{target_branch}' when ready",
                merged.short(),
                merged.short()
            )))
        }
        Ok(false) => engine
            .git
            .reset_hard(repo, merged)
            .map(|()| None)
            .map_err(|e| format!("could not advance checked-out target branch: {e}")),
        Ok(true) => {
            engine
                .git
                .reset_hard(repo, merged)
                .map_err(|e| format!("could not advance checked-out target branch: {e}"))?;
            let stash_patch = engine.git.stash_show_patch(repo).unwrap_or_default();
            if is_orchestrator_gitignore_only(&stash_patch) {
                let _ = engine.git.stash_drop(repo);
                Ok(None)
            } else if let Err(e) = engine.git.stash_pop(repo) {
                Ok(Some(format!(
                    "your changes are stashed; `git stash pop` failed ({e}), pop manually"
                )))
            } else {
                Ok(None)
            }
        }
    }
}

/// The conflict path: stash, check out the target, merge with the
/// resolver's help, restore the user's state.
#[allow(clippy::too_many_arguments)]
fn conflict_path_merge(
    engine: &Engine,
    plan_id: PlanId,
    node_id: &NodeId,
    attempt: u32,
    repo: &Path,
    target_branch: &str,
    completed: GitOid,
    message: &str,
    conflict_files: Vec<String>,
) -> RiResult {
    let original_branch = engine.git.current_branch(repo).ok().flatten();
    let needs_checkout = original_branch.as_deref() != Some(target_branch);

    let stashed = match engine.git.has_uncommitted_changes(repo) {
        Ok(true) => match engine.git.stash_push(repo, "convoy: hold changes for merge") {
            Ok(stashed) => stashed,
            Err(e) => {
                return RiResult::Failed {
                    error: format!("could not stash working tree before merge: {e}"),
                };
            }
        },
        Ok(false) => false,
        Err(e) => {
            return RiResult::Failed {
                error: format!("could not inspect working tree: {e}"),
            };
        }
    };

    let restore = |engine: &Engine| {
        if needs_checkout
            && let Some(branch) = &original_branch
            && let Err(e) = engine.git.checkout(repo, branch)
        {
            warn!(error = %e, "could not restore original branch");
        }
        if stashed && let Err(e) = engine.git.stash_pop(repo) {
            warn!(error = %e, "could not restore stashed changes");
            return Some(format!(
                "your changes are stashed; `git stash pop` failed ({e}), pop manually"
            ));
        }
        None
    };

    if needs_checkout && let Err(e) = engine.git.checkout(repo, target_branch) {
        restore(engine);
        return RiResult::Failed {
            error: format!("could not check out '{target_branch}': {e}"),
        };
    }

    let merge = match engine.git.merge_no_commit(repo, completed) {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = restore(engine);
            return RiResult::Failed {
                error: format!("merge failed: {e}"),
            };
        }
    };

    let mut metrics = Metrics::new();
    if merge.success {
        // The in-memory merge predicted conflicts but the checkout merge
        // went clean (tip moved under us). Conclude it.
        if let Err(e) = engine.git.commit_all(repo, message) {
            let _ = engine.git.abort_merge(repo);
            let _ = restore(engine);
            return RiResult::Failed {
                error: format!("could not commit merge: {e}"),
            };
        }
    } else if merge.has_conflicts {
        let request = ResolveRequest {
            cwd: repo.to_path_buf(),
            source: format!("commit {}", completed.short()),
            target: format!("branch {target_branch}"),
            conflict_files: if merge.conflict_files.is_empty() {
                conflict_files
            } else {
                merge.conflict_files.clone()
            },
            commit_message: message.to_owned(),
            prefer: engine.config.merge.prefer,
        };
        let resolved = resolve_with_logging(engine, plan_id, node_id, attempt, &request);
        for (key, value) in &resolved.metrics {
            *metrics.entry(key.clone()).or_insert(0) += value;
        }
        if !resolved.success {
            let _ = engine.git.abort_merge(repo);
            restore(engine);
            return RiResult::Failed {
                error: resolved
                    .error
                    .unwrap_or_else(|| "conflict resolution failed".to_owned()),
            };
        }
    } else {
        let _ = restore(engine);
        return RiResult::Failed {
            error: merge
                .error
                .unwrap_or_else(|| "merge failed without conflicts".to_owned()),
        };
    }

    info!(node = %node_id, target = target_branch, "conflict-path merge committed");
    let advisory = restore(engine);
    RiResult::Merged { advisory, metrics }
}

/// Bounded retries with linear backoff for transient ref-lock contention.
fn update_ref_with_retry(
    engine: &Engine,
    repo: &Path,
    target_ref: &str,
    new: GitOid,
    expected_old: Option<GitOid>,
) -> Result<(), GitError> {
    let mut last = None;
    for round in 1..=UPDATE_REF_ATTEMPTS {
        match engine.git.update_ref(repo, target_ref, new, expected_old) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_lock_contention() && round < UPDATE_REF_ATTEMPTS => {
                warn!(%target_ref, round, "ref locked, retrying");
                std::thread::sleep(Duration::from_millis(100 * u64::from(round)));
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or(GitError::NotFound {
        message: format!("ref {target_ref} update failed"),
    }))
}

fn push_if_configured(engine: &Engine, repo: &Path, target_branch: &str) {
    if !engine.config.merge.push_on_success {
        return;
    }
    if let Err(e) = engine.git.push(repo, "origin", target_branch) {
        // A push failure never fails the merge.
        warn!(branch = target_branch, error = %e, "push after merge failed");
    }
}

fn resolve_with_logging(
    engine: &Engine,
    plan_id: PlanId,
    node_id: &NodeId,
    attempt: u32,
    request: &ResolveRequest,
) -> ResolveOutcome {
    let on_output = |line: &str| {
        engine.logs.append(
            plan_id,
            node_id,
            attempt,
            Some(Phase::MergeRi),
            LogLevel::Info,
            line,
        );
    };
    engine.resolver.resolve(request, &on_output)
}

// ---------------------------------------------------------------------------
// Orchestrator-only diff detection
// ---------------------------------------------------------------------------

/// Whether a unified diff touches only `.gitignore`, and only with the
/// orchestrator's own entries.
///
/// Deliberately conservative: any other file, or any added/removed line
/// that is not exactly an orchestrator entry, makes this `false` and the
/// user's changes are preserved.
fn is_orchestrator_gitignore_only(diff: &str) -> bool {
    if diff.trim().is_empty() {
        return false;
    }
    let mut saw_change = false;
    for line in diff.lines() {
        if let Some(header) = line.strip_prefix("diff --git ") {
            // Header form: `a/<path> b/<path>`.
            let only_gitignore = header
                .split_whitespace()
                .all(|p| p == "a/.gitignore" || p == "b/.gitignore");
            if !only_gitignore {
                return false;
            }
            continue;
        }
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            if !ORCHESTRATOR_IGNORE_ENTRIES.contains(&added.trim()) {
                return false;
            }
            saw_change = true;
        } else if let Some(removed) = line.strip_prefix('-') {
            if !ORCHESTRATOR_IGNORE_ENTRIES.contains(&removed.trim()) {
                return false;
            }
            saw_change = true;
        }
    }
    saw_change
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_diff_is_not_orchestrator_only() {
        assert!(!is_orchestrator_gitignore_only(""));
        assert!(!is_orchestrator_gitignore_only("   \n"));
    }

    #[test]
    fn pure_orchestrator_gitignore_diff_is_detected() {
        let diff = "\
diff --git a/.gitignore b/.gitignore
index e69de29..5a2a6b1 100644
--- a/.gitignore
+++ b/.gitignore
@@ -0,0 +1 @@
+.convoy/
";
        assert!(is_orchestrator_gitignore_only(diff));
    }

    #[test]
    fn user_line_in_gitignore_diff_is_preserved() {
        let diff = "\
diff --git a/.gitignore b/.gitignore
--- a/.gitignore
+++ b/.gitignore
@@ -0,0 +2 @@
+.convoy/
+my-secret-notes.txt
";
        assert!(!is_orchestrator_gitignore_only(diff));
    }

    #[test]
    fn diff_touching_other_files_is_preserved() {
        let diff = "\
diff --git a/src/main.rs b/src/main.rs
--- a/src/main.rs
+++ b/src/main.rs
@@ -1 +1 @@
-fn main() {}
+fn main() { run() }
";
        assert!(!is_orchestrator_gitignore_only(diff));
    }

    #[test]
    fn mixed_files_are_preserved() {
        let diff = "\
diff --git a/.gitignore b/.gitignore
--- a/.gitignore
+++ b/.gitignore
@@ -0,0 +1 @@
+.convoy/
diff --git a/README.md b/README.md
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-old
+new
";
        assert!(!is_orchestrator_gitignore_only(diff));
    }
}
