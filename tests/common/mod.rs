//! Shared test helpers for convoy integration tests.
//!
//! All tests use temp directories — no side effects on the real repo.
//! Each test gets its own git repo via `setup_repo()` and its own
//! storage root; the pump runs with a short tick so scenarios finish in
//! milliseconds, not seconds.

#![allow(dead_code)]

use std::path::Path;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use convoy::model::{JobPhases, JobSpec, NodeKind, PhaseSpec, PlanSpec};
use convoy::orchestrator::OrchestratorBuilder;
use convoy::runner::{AgentLauncher, AgentOutcome, ExecutionContext, ShellJobExecutor};
use convoy::ConvoyConfig;
use convoy_git::{CliGateway, GitError, GitGateway, GitOid};

/// Run a git command in `cwd`, asserting success.
pub fn git(cwd: &Path, args: &[&str]) -> Output {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("failed to spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    out
}

/// Create a fresh repo with `main` checked out and one initial commit.
pub fn setup_repo() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test User"]);
    std::fs::write(dir.path().join("README.md"), "# test repo\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "initial commit"]);
    dir
}

/// Resolve a commitish in a repo.
pub fn rev_parse(repo: &Path, refish: &str) -> GitOid {
    CliGateway::new()
        .resolve_ref(repo, refish)
        .unwrap()
        .unwrap_or_else(|| panic!("{refish} does not resolve"))
}

/// A configuration rooted in a temp storage dir with a fast pump.
pub fn fast_config(storage: &TempDir) -> ConvoyConfig {
    let mut config = ConvoyConfig::defaults();
    config.storage_path = storage.path().join("storage");
    config.pump_interval_ms = 25;
    config
}

/// A builder with the fast config; tests chain their own collaborators.
pub fn builder(storage: &TempDir) -> OrchestratorBuilder {
    OrchestratorBuilder::new(fast_config(storage))
}

/// Shorthand for a shell phase spec.
pub fn shell(cmd: &str) -> PhaseSpec {
    PhaseSpec::Shell {
        command: cmd.to_owned(),
        timeout_ms: None,
    }
}

/// A job spec with only a work phase.
pub fn job(id: &str, deps: &[&str], work: &str) -> JobSpec {
    JobSpec {
        id: id.to_owned(),
        depends_on: deps.iter().map(|s| (*s).to_owned()).collect(),
        kind: NodeKind::Job(JobPhases {
            prechecks: None,
            work: Some(shell(work)),
            postchecks: None,
        }),
        auto_heal: false,
        expects_no_changes: false,
    }
}

/// A plan spec over the given jobs.
pub fn plan(jobs: Vec<JobSpec>, target: Option<&str>) -> PlanSpec {
    PlanSpec {
        name: "test plan".to_owned(),
        jobs,
        base_branch: "main".to_owned(),
        target_branch: target.map(str::to_owned),
        max_parallel: 4,
    }
}

/// Generous wall-clock limit for a scenario.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// An agent launcher that runs a canned shell command in the worktree and
/// reports success iff it exits zero. Stands in for a real agent in
/// auto-heal tests.
pub struct ShellAgentStub {
    pub command: String,
    pub launches: AtomicUsize,
}

impl ShellAgentStub {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
            launches: AtomicUsize::new(0),
        }
    }
}

impl AgentLauncher for ShellAgentStub {
    fn launch(
        &self,
        ctx: &ExecutionContext,
        _phase: convoy::model::Phase,
        _instructions: &str,
        resume_session: Option<&str>,
    ) -> AgentOutcome {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let out = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&ctx.worktree_path)
            .output();
        match out {
            Ok(out) if out.status.success() => AgentOutcome {
                success: true,
                session_id: Some(
                    resume_session.map_or_else(|| "session-1".to_owned(), str::to_owned),
                ),
                ..AgentOutcome::default()
            },
            Ok(out) => AgentOutcome {
                success: false,
                error: Some(format!(
                    "agent command failed: {}",
                    String::from_utf8_lossy(&out.stderr)
                )),
                exit_code: out.status.code(),
                ..AgentOutcome::default()
            },
            Err(e) => AgentOutcome {
                success: false,
                error: Some(e.to_string()),
                ..AgentOutcome::default()
            },
        }
    }
}

/// Build the reference runner with an agent stub attached.
pub fn runner_with_agent(stub: Arc<ShellAgentStub>) -> Arc<ShellJobExecutor> {
    Arc::new(ShellJobExecutor::with_agent_launcher(
        Arc::new(CliGateway::new()),
        stub,
    ))
}

/// A gateway that fails `update_ref` a configurable number of times, then
/// delegates. Simulates transient (or persistent) target-branch update
/// failures.
pub struct FlakyRefGateway {
    inner: CliGateway,
    failures_left: AtomicUsize,
}

impl FlakyRefGateway {
    pub fn failing(times: usize) -> Self {
        Self {
            inner: CliGateway::new(),
            failures_left: AtomicUsize::new(times),
        }
    }
}

impl GitGateway for FlakyRefGateway {
    fn create_or_reuse_detached(
        &self,
        repo: &Path,
        path: &Path,
        base_commitish: &str,
    ) -> Result<convoy_git::WorktreeCreation, GitError> {
        self.inner.create_or_reuse_detached(repo, path, base_commitish)
    }

    fn remove_worktree_safe(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        self.inner.remove_worktree_safe(repo, path)
    }

    fn head_commit(&self, cwd: &Path) -> Result<GitOid, GitError> {
        self.inner.head_commit(cwd)
    }

    fn resolve_ref(&self, cwd: &Path, refish: &str) -> Result<Option<GitOid>, GitError> {
        self.inner.resolve_ref(cwd, refish)
    }

    fn current_branch(&self, cwd: &Path) -> Result<Option<String>, GitError> {
        self.inner.current_branch(cwd)
    }

    fn update_ref(
        &self,
        repo: &Path,
        ref_name: &str,
        new: GitOid,
        expected_old: Option<GitOid>,
    ) -> Result<(), GitError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(GitError::CommandFailed {
                command: "git update-ref".to_owned(),
                stderr: "simulated ref update failure".to_owned(),
                exit_code: Some(128),
            });
        }
        self.inner.update_ref(repo, ref_name, new, expected_old)
    }

    fn has_uncommitted_changes(&self, cwd: &Path) -> Result<bool, GitError> {
        self.inner.has_uncommitted_changes(cwd)
    }

    fn checkout(&self, cwd: &Path, refish: &str) -> Result<(), GitError> {
        self.inner.checkout(cwd, refish)
    }

    fn reset_hard(&self, cwd: &Path, commit: GitOid) -> Result<(), GitError> {
        self.inner.reset_hard(cwd, commit)
    }

    fn clean_untracked(&self, cwd: &Path) -> Result<(), GitError> {
        self.inner.clean_untracked(cwd)
    }

    fn working_diff(&self, cwd: &Path) -> Result<String, GitError> {
        self.inner.working_diff(cwd)
    }

    fn stash_push(&self, cwd: &Path, message: &str) -> Result<bool, GitError> {
        self.inner.stash_push(cwd, message)
    }

    fn stash_pop(&self, cwd: &Path) -> Result<(), GitError> {
        self.inner.stash_pop(cwd)
    }

    fn stash_drop(&self, cwd: &Path) -> Result<(), GitError> {
        self.inner.stash_drop(cwd)
    }

    fn stash_show_patch(&self, cwd: &Path) -> Result<String, GitError> {
        self.inner.stash_show_patch(cwd)
    }

    fn fetch(&self, cwd: &Path, remote: &str) -> Result<(), GitError> {
        self.inner.fetch(cwd, remote)
    }

    fn push(&self, cwd: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        self.inner.push(cwd, remote, branch)
    }

    fn merge(
        &self,
        cwd: &Path,
        source: GitOid,
        message: &str,
    ) -> Result<convoy_git::MergeOutcome, GitError> {
        self.inner.merge(cwd, source, message)
    }

    fn merge_no_commit(
        &self,
        cwd: &Path,
        source: GitOid,
    ) -> Result<convoy_git::MergeOutcome, GitError> {
        self.inner.merge_no_commit(cwd, source)
    }

    fn abort_merge(&self, cwd: &Path) -> Result<(), GitError> {
        self.inner.abort_merge(cwd)
    }

    fn merge_without_checkout(
        &self,
        repo: &Path,
        target: GitOid,
        source: GitOid,
    ) -> Result<convoy_git::MergeTreeOutcome, GitError> {
        self.inner.merge_without_checkout(repo, target, source)
    }

    fn commit_tree(
        &self,
        repo: &Path,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
    ) -> Result<GitOid, GitError> {
        self.inner.commit_tree(repo, tree, parents, message)
    }

    fn commit_all(&self, cwd: &Path, message: &str) -> Result<Option<GitOid>, GitError> {
        self.inner.commit_all(cwd, message)
    }

    fn list_commits(
        &self,
        repo: &Path,
        from: Option<GitOid>,
        to: GitOid,
    ) -> Result<Vec<convoy_git::CommitInfo>, GitError> {
        self.inner.list_commits(repo, from, to)
    }

    fn diff_entries(
        &self,
        repo: &Path,
        from: GitOid,
        to: GitOid,
    ) -> Result<Vec<convoy_git::DiffEntry>, GitError> {
        self.inner.diff_entries(repo, from, to)
    }

    fn ensure_gitignore_entries(&self, repo: &Path, entries: &[&str]) -> Result<bool, GitError> {
        self.inner.ensure_gitignore_entries(repo, entries)
    }
}

/// A conflict resolver that resolves every conflict by taking the merge
/// head's version (`theirs`) and committing.
pub struct TheirsResolver {
    pub invocations: AtomicUsize,
}

impl TheirsResolver {
    pub fn new() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
        }
    }
}

impl Default for TheirsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl convoy::resolver::ConflictResolver for TheirsResolver {
    fn resolve(
        &self,
        request: &convoy::resolver::ResolveRequest,
        _on_output: &dyn Fn(&str),
    ) -> convoy::resolver::ResolveOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        for file in &request.conflict_files {
            let out = Command::new("git")
                .args(["checkout", "--theirs", "--", file])
                .current_dir(&request.cwd)
                .output();
            if out.map(|o| !o.status.success()).unwrap_or(true) {
                return convoy::resolver::ResolveOutcome {
                    success: false,
                    error: Some(format!("could not take theirs for {file}")),
                    ..convoy::resolver::ResolveOutcome::default()
                };
            }
        }
        let staged = Command::new("git")
            .args(["add", "-A"])
            .current_dir(&request.cwd)
            .output();
        let committed = staged.and_then(|_| {
            Command::new("git")
                .args(["commit", "--no-edit", "-m", &request.commit_message])
                .current_dir(&request.cwd)
                .output()
        });
        match committed {
            Ok(out) if out.status.success() => convoy::resolver::ResolveOutcome {
                success: true,
                ..convoy::resolver::ResolveOutcome::default()
            },
            Ok(out) => convoy::resolver::ResolveOutcome {
                success: false,
                error: Some(String::from_utf8_lossy(&out.stderr).into_owned()),
                ..convoy::resolver::ResolveOutcome::default()
            },
            Err(e) => convoy::resolver::ResolveOutcome {
                success: false,
                error: Some(e.to_string()),
                ..convoy::resolver::ResolveOutcome::default()
            },
        }
    }
}
