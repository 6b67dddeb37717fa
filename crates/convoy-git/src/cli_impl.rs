//! [`CliGateway`] — the git CLI backend for [`GitGateway`].
//!
//! Every operation shells out to `git -C <path> ...` and classifies the
//! result by exit status and stderr. The CLI is the reference backend: it
//! behaves identically to what an operator would type by hand, which makes
//! failures reproducible outside the orchestrator.

use std::path::Path;
use std::process::Command;
use std::time::Instant;

use tracing::debug;

use crate::error::GitError;
use crate::gateway::GitGateway;
use crate::types::{
    CommitInfo, DiffEntry, DiffStatus, GitOid, MergeOutcome, MergeTreeOutcome, WorktreeCreation,
};

/// Git gateway backed by the `git` command-line tool.
///
/// Stateless: one instance serves every repository. Construct with
/// [`CliGateway::new`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CliGateway;

impl CliGateway {
    /// Create a new CLI gateway.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

// ---------------------------------------------------------------------------
// Subprocess helpers
// ---------------------------------------------------------------------------

/// Output of one git invocation, with stderr trimmed for error reporting.
struct GitOutput {
    status_code: Option<i32>,
    success: bool,
    stdout: String,
    stderr: String,
}

/// Run `git -C <cwd> <args>` and capture output. Spawn failures surface as
/// [`GitError::Io`]; non-zero exits are left for the caller to classify.
fn run_git(cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    debug!(cwd = %cwd.display(), args = ?args, "git");
    let output = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(args)
        .output()?;
    Ok(GitOutput {
        status_code: output.status.code(),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

/// Human-readable command string for error messages.
fn command_label(args: &[&str]) -> String {
    let mut label = String::from("git");
    for arg in args.iter().take(3) {
        label.push(' ');
        label.push_str(arg);
    }
    label
}

/// Run git, mapping any non-zero exit to [`GitError::CommandFailed`].
fn git_expect_ok(cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    let out = run_git(cwd, args)?;
    if out.success {
        Ok(out)
    } else {
        Err(GitError::CommandFailed {
            command: command_label(args),
            stderr: out.stderr,
            exit_code: out.status_code,
        })
    }
}

/// Run git and return trimmed stdout, mapping non-zero exit to an error.
fn git_stdout(cwd: &Path, args: &[&str]) -> Result<String, GitError> {
    Ok(git_expect_ok(cwd, args)?.stdout.trim().to_owned())
}

fn parse_oid(raw: &str) -> Result<GitOid, GitError> {
    raw.trim().parse().map_err(
        |e: crate::types::OidParseError| GitError::InvalidOid {
            value: e.value,
            reason: e.reason,
        },
    )
}

/// Paths of unmerged (conflicted) files in the working tree at `cwd`.
fn conflicted_files(cwd: &Path) -> Result<Vec<String>, GitError> {
    let out = git_stdout(cwd, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(out.lines().map(str::to_owned).collect())
}

/// Classify a failed merge invocation: conflicts are an outcome, anything
/// else is carried as the outcome's error text.
fn merge_failure_outcome(cwd: &Path, out: &GitOutput) -> Result<MergeOutcome, GitError> {
    let conflicts = conflicted_files(cwd)?;
    if conflicts.is_empty() {
        Ok(MergeOutcome {
            success: false,
            has_conflicts: false,
            conflict_files: vec![],
            error: Some(if out.stderr.is_empty() {
                out.stdout.trim().to_owned()
            } else {
                out.stderr.clone()
            }),
        })
    } else {
        Ok(MergeOutcome {
            success: false,
            has_conflicts: true,
            conflict_files: conflicts,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// GitGateway implementation
// ---------------------------------------------------------------------------

impl GitGateway for CliGateway {
    fn create_or_reuse_detached(
        &self,
        repo: &Path,
        path: &Path,
        base_commitish: &str,
    ) -> Result<WorktreeCreation, GitError> {
        let start = Instant::now();

        // An existing worktree (its .git link file is present) is reused
        // as-is so retries keep their working state.
        if path.join(".git").exists() {
            let head = self.head_commit(path)?;
            return Ok(WorktreeCreation {
                base_commit: head,
                reused: true,
                total_ms: elapsed_ms(start),
            });
        }

        let path_str = path.to_string_lossy();
        git_expect_ok(
            repo,
            &["worktree", "add", "--force", "--detach", &path_str, base_commitish],
        )?;
        let base = self.head_commit(path)?;
        Ok(WorktreeCreation {
            base_commit: base,
            reused: false,
            total_ms: elapsed_ms(start),
        })
    }

    fn remove_worktree_safe(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        let out = run_git(repo, &["worktree", "remove", "--force", &path_str])?;
        if !out.success {
            // The working directory may already be gone; prune cleans the
            // stale administrative entry either way.
            debug!(path = %path.display(), stderr = %out.stderr, "worktree remove fell back to prune");
            git_expect_ok(repo, &["worktree", "prune"])?;
        }
        Ok(())
    }

    fn head_commit(&self, cwd: &Path) -> Result<GitOid, GitError> {
        parse_oid(&git_stdout(cwd, &["rev-parse", "HEAD"])?)
    }

    fn resolve_ref(&self, cwd: &Path, refish: &str) -> Result<Option<GitOid>, GitError> {
        let spec = format!("{refish}^{{commit}}");
        let out = run_git(cwd, &["rev-parse", "--verify", "--quiet", &spec])?;
        if out.success {
            parse_oid(&out.stdout).map(Some)
        } else {
            Ok(None)
        }
    }

    fn current_branch(&self, cwd: &Path) -> Result<Option<String>, GitError> {
        let out = run_git(cwd, &["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if out.success {
            Ok(Some(out.stdout.trim().to_owned()))
        } else {
            // Detached HEAD.
            Ok(None)
        }
    }

    fn update_ref(
        &self,
        repo: &Path,
        ref_name: &str,
        new: GitOid,
        expected_old: Option<GitOid>,
    ) -> Result<(), GitError> {
        let new_hex = new.to_string();
        let old_hex = expected_old.map(|o| o.to_string());
        let mut args = vec!["update-ref", ref_name, new_hex.as_str()];
        if let Some(old) = old_hex.as_deref() {
            args.push(old);
        }
        let out = run_git(repo, &args)?;
        if out.success {
            return Ok(());
        }
        if out.stderr.contains("but expected") || out.stderr.contains("is at") {
            return Err(GitError::RefConflict {
                ref_name: ref_name.to_owned(),
                message: out.stderr,
            });
        }
        if out.stderr.contains(".lock") || out.stderr.contains("cannot lock") {
            return Err(GitError::RefLocked {
                ref_name: ref_name.to_owned(),
                message: out.stderr,
            });
        }
        Err(GitError::CommandFailed {
            command: command_label(&args),
            stderr: out.stderr,
            exit_code: out.status_code,
        })
    }

    fn has_uncommitted_changes(&self, cwd: &Path) -> Result<bool, GitError> {
        let out = git_stdout(cwd, &["status", "--porcelain"])?;
        Ok(!out.is_empty())
    }

    fn checkout(&self, cwd: &Path, refish: &str) -> Result<(), GitError> {
        git_expect_ok(cwd, &["checkout", refish]).map(|_| ())
    }

    fn reset_hard(&self, cwd: &Path, commit: GitOid) -> Result<(), GitError> {
        let hex = commit.to_string();
        git_expect_ok(cwd, &["reset", "--hard", &hex]).map(|_| ())
    }

    fn clean_untracked(&self, cwd: &Path) -> Result<(), GitError> {
        git_expect_ok(cwd, &["clean", "-fd"]).map(|_| ())
    }

    fn working_diff(&self, cwd: &Path) -> Result<String, GitError> {
        Ok(git_expect_ok(cwd, &["diff"])?.stdout)
    }

    fn stash_push(&self, cwd: &Path, message: &str) -> Result<bool, GitError> {
        let out = git_expect_ok(cwd, &["stash", "push", "--include-untracked", "-m", message])?;
        Ok(!out.stdout.contains("No local changes to save"))
    }

    fn stash_pop(&self, cwd: &Path) -> Result<(), GitError> {
        git_expect_ok(cwd, &["stash", "pop"]).map(|_| ())
    }

    fn stash_drop(&self, cwd: &Path) -> Result<(), GitError> {
        git_expect_ok(cwd, &["stash", "drop"]).map(|_| ())
    }

    fn stash_show_patch(&self, cwd: &Path) -> Result<String, GitError> {
        // `stash show` exits non-zero when there is no stash entry; report
        // that as NotFound so callers can distinguish it from real failures.
        let out = run_git(cwd, &["stash", "show", "-p", "stash@{0}"])?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(GitError::NotFound {
                message: format!("no stash entry to show: {}", out.stderr),
            })
        }
    }

    fn fetch(&self, cwd: &Path, remote: &str) -> Result<(), GitError> {
        git_expect_ok(cwd, &["fetch", remote]).map(|_| ())
    }

    fn push(&self, cwd: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        let out = run_git(cwd, &["push", remote, branch])?;
        if out.success {
            Ok(())
        } else {
            Err(GitError::PushFailed {
                remote: remote.to_owned(),
                message: out.stderr,
            })
        }
    }

    fn merge(&self, cwd: &Path, source: GitOid, message: &str) -> Result<MergeOutcome, GitError> {
        let hex = source.to_string();
        let out = run_git(cwd, &["merge", "--no-ff", "--no-edit", "-m", message, &hex])?;
        if out.success {
            Ok(MergeOutcome {
                success: true,
                ..MergeOutcome::default()
            })
        } else {
            merge_failure_outcome(cwd, &out)
        }
    }

    fn merge_no_commit(&self, cwd: &Path, source: GitOid) -> Result<MergeOutcome, GitError> {
        let hex = source.to_string();
        let out = run_git(cwd, &["merge", "--no-commit", "--no-ff", &hex])?;
        if out.success {
            Ok(MergeOutcome {
                success: true,
                ..MergeOutcome::default()
            })
        } else {
            merge_failure_outcome(cwd, &out)
        }
    }

    fn abort_merge(&self, cwd: &Path) -> Result<(), GitError> {
        git_expect_ok(cwd, &["merge", "--abort"]).map(|_| ())
    }

    fn merge_without_checkout(
        &self,
        repo: &Path,
        target: GitOid,
        source: GitOid,
    ) -> Result<MergeTreeOutcome, GitError> {
        let target_hex = target.to_string();
        let source_hex = source.to_string();
        let args = [
            "merge-tree",
            "--write-tree",
            "--name-only",
            target_hex.as_str(),
            source_hex.as_str(),
        ];
        let out = run_git(repo, &args)?;
        // Exit 0: clean merge. Exit 1: conflicted merge. Anything else is a
        // hard failure (bad object, unrelated histories with no base, ...).
        match out.status_code {
            Some(0) => {
                let tree = parse_oid(out.stdout.lines().next().unwrap_or_default())?;
                Ok(MergeTreeOutcome {
                    tree: Some(tree),
                    conflict_files: vec![],
                })
            }
            Some(1) => {
                // Format: merged-tree OID, then conflicted names, then a
                // blank line and informational messages.
                let mut lines = out.stdout.lines();
                let _tree = lines.next();
                let conflict_files = lines
                    .take_while(|l| !l.trim().is_empty())
                    .map(str::to_owned)
                    .collect();
                Ok(MergeTreeOutcome {
                    tree: None,
                    conflict_files,
                })
            }
            _ => Err(GitError::CommandFailed {
                command: command_label(&args),
                stderr: out.stderr,
                exit_code: out.status_code,
            }),
        }
    }

    fn commit_tree(
        &self,
        repo: &Path,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
    ) -> Result<GitOid, GitError> {
        let tree_hex = tree.to_string();
        let parent_hexes: Vec<String> = parents.iter().map(GitOid::to_string).collect();
        let mut args = vec!["commit-tree".to_owned(), tree_hex];
        for parent in &parent_hexes {
            args.push("-p".to_owned());
            args.push(parent.clone());
        }
        args.push("-m".to_owned());
        args.push(message.to_owned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        parse_oid(&git_stdout(repo, &arg_refs)?)
    }

    fn commit_all(&self, cwd: &Path, message: &str) -> Result<Option<GitOid>, GitError> {
        git_expect_ok(cwd, &["add", "-A"])?;
        if !self.has_uncommitted_changes(cwd)? {
            return Ok(None);
        }
        git_expect_ok(cwd, &["commit", "-m", message])?;
        self.head_commit(cwd).map(Some)
    }

    fn list_commits(
        &self,
        repo: &Path,
        from: Option<GitOid>,
        to: GitOid,
    ) -> Result<Vec<CommitInfo>, GitError> {
        let range = from.map_or_else(|| to.to_string(), |f| format!("{f}..{to}"));
        let out = git_stdout(
            repo,
            &["log", "--reverse", "--format=%H%x09%h%x09%s", &range],
        )?;
        let mut commits = Vec::new();
        for line in out.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(full), Some(short), Some(summary)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            commits.push(CommitInfo {
                id: parse_oid(full)?,
                short_id: short.to_owned(),
                summary: summary.to_owned(),
            });
        }
        Ok(commits)
    }

    fn diff_entries(
        &self,
        repo: &Path,
        from: GitOid,
        to: GitOid,
    ) -> Result<Vec<DiffEntry>, GitError> {
        let from_hex = from.to_string();
        let to_hex = to.to_string();
        let out = git_stdout(repo, &["diff", "--name-status", &from_hex, &to_hex])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            let mut fields = line.split('\t');
            let Some(status) = fields.next() else { continue };
            // Renames and copies list two paths; the last is the current one.
            let Some(path) = fields.next_back() else { continue };
            let letter = status.chars().next().unwrap_or('M');
            entries.push(DiffEntry {
                status: DiffStatus::from_letter(letter),
                path: path.to_owned(),
            });
        }
        Ok(entries)
    }

    fn ensure_gitignore_entries(&self, repo: &Path, entries: &[&str]) -> Result<bool, GitError> {
        let path = repo.join(".gitignore");
        let existing = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let present: Vec<&str> = existing.lines().map(str::trim).collect();
        let missing: Vec<&str> = entries
            .iter()
            .copied()
            .filter(|e| !present.contains(&e.trim()))
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        for entry in missing {
            updated.push_str(entry);
            updated.push('\n');
        }
        std::fs::write(&path, updated)?;
        Ok(true)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests (pure parsing helpers; repository-level tests live in tests/)
// ---------------------------------------------------------------------------
