//! The reference [`JobExecutor`]: shell and process phases executed
//! directly in the worktree, with a pluggable launcher for agent phases.
//!
//! Phases run in order (prechecks, work, postchecks), honoring the
//! resume-from hint. After the last phase, the executor stages and commits
//! whatever the phases changed; a clean worktree is not an error — the
//! node simply carries its base commit forward.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use convoy_git::GitGateway;

use crate::logs::LogLevel;
use crate::model::plan::PhaseSpec;
use crate::model::{Phase, PhaseStatus};
use crate::runner::{ExecutionContext, ExecutionResult, JobExecutor};

// ---------------------------------------------------------------------------
// Agent launcher hook
// ---------------------------------------------------------------------------

/// Outcome of one agent launch.
#[derive(Clone, Debug, Default)]
pub struct AgentOutcome {
    /// Whether the agent completed its task.
    pub success: bool,
    /// Session identifier for resuming the same agent later.
    pub session_id: Option<String>,
    /// Error description on failure.
    pub error: Option<String>,
    /// Exit code of the agent process, when one exists.
    pub exit_code: Option<i32>,
    /// Agent-reported metrics.
    pub metrics: crate::model::Metrics,
}

/// Hook that executes agent-typed phases.
///
/// Agents are an external collaborator; the shell executor only knows how
/// to hand them instructions and a worktree.
pub trait AgentLauncher: Send + Sync {
    /// Run an agent task in the context's worktree.
    fn launch(
        &self,
        ctx: &ExecutionContext,
        phase: Phase,
        instructions: &str,
        resume_session: Option<&str>,
    ) -> AgentOutcome;
}

/// The default launcher: reports agent phases as unsupported.
pub struct UnsupportedAgentLauncher;

impl AgentLauncher for UnsupportedAgentLauncher {
    fn launch(
        &self,
        _ctx: &ExecutionContext,
        phase: Phase,
        _instructions: &str,
        _resume_session: Option<&str>,
    ) -> AgentOutcome {
        AgentOutcome {
            success: false,
            error: Some(format!(
                "phase '{phase}' is an agent task, but no agent launcher is configured"
            )),
            ..AgentOutcome::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ShellJobExecutor
// ---------------------------------------------------------------------------

/// Reference work runner: shell/process phases via subprocesses, agent
/// phases via the injected launcher, commit via the git gateway.
pub struct ShellJobExecutor {
    git: Arc<dyn GitGateway>,
    agents: Arc<dyn AgentLauncher>,
}

impl ShellJobExecutor {
    /// Create a runner with the default (unsupported) agent launcher.
    #[must_use]
    pub fn new(git: Arc<dyn GitGateway>) -> Self {
        Self {
            git,
            agents: Arc::new(UnsupportedAgentLauncher),
        }
    }

    /// Create a runner with an agent launcher.
    #[must_use]
    pub fn with_agent_launcher(git: Arc<dyn GitGateway>, agents: Arc<dyn AgentLauncher>) -> Self {
        Self { git, agents }
    }
}

impl JobExecutor for ShellJobExecutor {
    fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let mut statuses: BTreeMap<Phase, PhaseStatus> = BTreeMap::new();
        let mut result = ExecutionResult::default();

        for phase in [Phase::Prechecks, Phase::Work, Phase::Postchecks] {
            if ctx.aborted.load(Ordering::SeqCst) {
                return ExecutionResult::canceled(statuses);
            }

            let Some(spec) = ctx.phases.slot(phase) else {
                continue;
            };

            // Resume support: phases before the resume point were already
            // completed by an earlier attempt.
            if let Some(resume) = ctx.resume_from_phase
                && !phase.at_or_after(resume)
            {
                statuses.insert(phase, PhaseStatus::Skipped);
                ctx.events.on_phase_status(phase, PhaseStatus::Skipped);
                continue;
            }

            ctx.events
                .on_log(phase, LogLevel::Info, &format!("starting: {}", spec.describe()));
            let outcome = self.run_phase(ctx, phase, spec, &mut result);
            match outcome {
                PhaseRun::Success => {
                    statuses.insert(phase, PhaseStatus::Success);
                    ctx.events.on_phase_status(phase, PhaseStatus::Success);
                }
                PhaseRun::Canceled => {
                    return ExecutionResult::canceled(statuses);
                }
                PhaseRun::Failed { error, exit_code } => {
                    statuses.insert(phase, PhaseStatus::Failed);
                    ctx.events.on_phase_status(phase, PhaseStatus::Failed);
                    ctx.events.on_log(phase, LogLevel::Error, &error);
                    result.success = false;
                    result.failed_phase = Some(phase);
                    result.error = Some(error);
                    result.exit_code = exit_code;
                    result.phase_statuses = statuses;
                    return result;
                }
            }
        }

        // Commit step: stage and commit whatever the phases changed.
        let message = format!("{}: attempt {}", ctx.node_id, ctx.attempt);
        match self.git.commit_all(&ctx.worktree_path, &message) {
            Ok(Some(commit)) => {
                statuses.insert(Phase::Commit, PhaseStatus::Success);
                ctx.events.on_phase_status(Phase::Commit, PhaseStatus::Success);
                ctx.events.on_log(
                    Phase::Commit,
                    LogLevel::Info,
                    &format!("committed {}", commit.short()),
                );
                result.completed_commit = Some(commit);
            }
            Ok(None) => {
                // Nothing changed; the worktree HEAD (which may already
                // include commits made by the phases themselves) stands.
                match self.git.head_commit(&ctx.worktree_path) {
                    Ok(head) => {
                        statuses.insert(Phase::Commit, PhaseStatus::Success);
                        ctx.events.on_phase_status(Phase::Commit, PhaseStatus::Success);
                        result.completed_commit = Some(head);
                    }
                    Err(e) => {
                        statuses.insert(Phase::Commit, PhaseStatus::Failed);
                        ctx.events.on_phase_status(Phase::Commit, PhaseStatus::Failed);
                        result.success = false;
                        result.failed_phase = Some(Phase::Commit);
                        result.error = Some(e.to_string());
                        result.phase_statuses = statuses;
                        return result;
                    }
                }
            }
            Err(e) => {
                statuses.insert(Phase::Commit, PhaseStatus::Failed);
                ctx.events.on_phase_status(Phase::Commit, PhaseStatus::Failed);
                result.success = false;
                result.failed_phase = Some(Phase::Commit);
                result.error = Some(e.to_string());
                result.phase_statuses = statuses;
                return result;
            }
        }

        result.success = true;
        result.phase_statuses = statuses;
        result
    }
}

/// Internal outcome of a single phase run.
enum PhaseRun {
    Success,
    Canceled,
    Failed {
        error: String,
        exit_code: Option<i32>,
    },
}

impl ShellJobExecutor {
    fn run_phase(
        &self,
        ctx: &ExecutionContext,
        phase: Phase,
        spec: &PhaseSpec,
        result: &mut ExecutionResult,
    ) -> PhaseRun {
        match spec {
            PhaseSpec::Shell {
                command,
                timeout_ms,
            } => {
                let mut cmd = shell_command(command);
                cmd.current_dir(&ctx.worktree_path);
                run_to_completion(ctx, phase, cmd, *timeout_ms, result)
            }
            PhaseSpec::Process {
                program,
                args,
                env,
                timeout_ms,
            } => {
                let mut cmd = Command::new(program);
                cmd.args(args).envs(env).current_dir(&ctx.worktree_path);
                run_to_completion(ctx, phase, cmd, *timeout_ms, result)
            }
            PhaseSpec::Agent { instructions } => {
                let outcome = self.agents.launch(
                    ctx,
                    phase,
                    instructions,
                    ctx.agent_session_id.as_deref(),
                );
                if let Some(session) = &outcome.session_id {
                    result.agent_session_id = Some(session.clone());
                }
                for (key, value) in &outcome.metrics {
                    *result.metrics.entry(key.clone()).or_insert(0) += value;
                }
                if outcome.success {
                    PhaseRun::Success
                } else {
                    PhaseRun::Failed {
                        error: outcome
                            .error
                            .unwrap_or_else(|| "agent task failed".to_owned()),
                        exit_code: outcome.exit_code,
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Spawn the command, enforce timeout + cancellation by polling, and
/// stream captured output into the log callbacks.
///
/// Pipes are drained on their own threads while the parent polls, so a
/// chatty child never blocks on a full pipe.
fn run_to_completion(
    ctx: &ExecutionContext,
    phase: Phase,
    mut cmd: Command,
    timeout_ms: Option<u64>,
    result: &mut ExecutionResult,
) -> PhaseRun {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return PhaseRun::Failed {
                error: format!("failed to spawn process: {e}"),
                exit_code: None,
            };
        }
    };

    let pid = child.id();
    result.pid = Some(pid);
    ctx.events.on_pid(Some(pid));
    debug!(node = %ctx.node_id, %phase, pid, "phase process started");

    let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
    let stderr_reader = child.stderr.take().map(spawn_pipe_reader);
    let drain = |out: Option<std::thread::JoinHandle<Vec<String>>>, level: LogLevel| {
        for line in out.and_then(|h| h.join().ok()).unwrap_or_default() {
            ctx.events.on_log(phase, level, &line);
        }
    };

    let started = Instant::now();
    let deadline = timeout_ms.map(Duration::from_millis);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(e) => break Err(e),
        }
        if ctx.aborted.load(Ordering::SeqCst) {
            let _ = child.kill();
            let _ = child.wait();
            drain(stdout_reader, LogLevel::Info);
            drain(stderr_reader, LogLevel::Warn);
            ctx.events.on_pid(None);
            return PhaseRun::Canceled;
        }
        if let Some(limit) = deadline
            && started.elapsed() > limit
        {
            let _ = child.kill();
            let _ = child.wait();
            drain(stdout_reader, LogLevel::Info);
            drain(stderr_reader, LogLevel::Warn);
            ctx.events.on_pid(None);
            return PhaseRun::Failed {
                error: format!("phase timed out after {}ms", limit.as_millis()),
                exit_code: None,
            };
        }
        std::thread::sleep(Duration::from_millis(25));
    };
    ctx.events.on_pid(None);
    drain(stdout_reader, LogLevel::Info);
    drain(stderr_reader, LogLevel::Warn);

    match status {
        Ok(status) if status.success() => PhaseRun::Success,
        Ok(status) => PhaseRun::Failed {
            error: status.code().map_or_else(
                || "process terminated by signal".to_owned(),
                |code| format!("process exited with code {code}"),
            ),
            exit_code: status.code(),
        },
        Err(e) => PhaseRun::Failed {
            error: format!("failed to wait on process: {e}"),
            exit_code: None,
        },
    }
}

/// Read a child pipe to EOF on a dedicated thread, collecting lines.
fn spawn_pipe_reader<R: std::io::Read + Send + 'static>(
    pipe: R,
) -> std::thread::JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        use std::io::BufRead as _;
        std::io::BufReader::new(pipe)
            .lines()
            .map_while(Result::ok)
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::JobPhases;
    use crate::model::types::{NodeId, PlanId};
    use crate::runner::NullRunnerEvents;
    use convoy_git::CliGateway;
    use std::path::Path;
    use std::process::Command as StdCommand;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            let out = StdCommand::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
            let out = StdCommand::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        dir
    }

    fn context(worktree: &Path, phases: JobPhases) -> ExecutionContext {
        let base = CliGateway::new().head_commit(worktree).unwrap();
        ExecutionContext {
            plan_id: PlanId::generate(),
            node_id: NodeId::new("n").unwrap(),
            base_commit: base,
            worktree_path: worktree.to_path_buf(),
            attempt: 1,
            resume_from_phase: None,
            previous_phase_statuses: BTreeMap::new(),
            agent_session_id: None,
            phases,
            aborted: Arc::new(AtomicBool::new(false)),
            events: Arc::new(NullRunnerEvents),
        }
    }

    fn shell(cmd: &str) -> PhaseSpec {
        PhaseSpec::Shell {
            command: cmd.to_owned(),
            timeout_ms: None,
        }
    }

    fn runner() -> ShellJobExecutor {
        ShellJobExecutor::new(Arc::new(CliGateway::new()))
    }

    #[test]
    fn work_phase_commits_its_changes() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: None,
                work: Some(shell("echo artifact > artifact.txt")),
                postchecks: None,
            },
        );
        let result = runner().execute(&ctx);
        assert!(result.success, "unexpected failure: {:?}", result.error);
        let commit = result.completed_commit.unwrap();
        assert_ne!(commit, ctx.base_commit);
        assert_eq!(
            result.phase_statuses.get(&Phase::Work),
            Some(&PhaseStatus::Success)
        );
        assert_eq!(
            result.phase_statuses.get(&Phase::Commit),
            Some(&PhaseStatus::Success)
        );
    }

    #[test]
    fn no_changes_carries_base_commit_forward() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: None,
                work: Some(shell("true")),
                postchecks: None,
            },
        );
        let result = runner().execute(&ctx);
        assert!(result.success);
        assert_eq!(result.completed_commit, Some(ctx.base_commit));
    }

    #[test]
    fn failing_phase_reports_exit_code() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: None,
                work: Some(shell("exit 7")),
                postchecks: None,
            },
        );
        let result = runner().execute(&ctx);
        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(Phase::Work));
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(
            result.phase_statuses.get(&Phase::Work),
            Some(&PhaseStatus::Failed)
        );
    }

    #[test]
    fn failing_prechecks_stop_the_attempt() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: Some(shell("false")),
                work: Some(shell("echo should-not-run > marker.txt")),
                postchecks: None,
            },
        );
        let result = runner().execute(&ctx);
        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(Phase::Prechecks));
        assert!(!repo.path().join("marker.txt").exists());
        assert!(!result.phase_statuses.contains_key(&Phase::Work));
    }

    #[test]
    fn resume_skips_completed_phases() {
        let repo = setup_repo();
        let mut ctx = context(
            repo.path(),
            JobPhases {
                prechecks: Some(shell("echo pre > pre.txt")),
                work: Some(shell("echo work > work.txt")),
                postchecks: None,
            },
        );
        ctx.resume_from_phase = Some(Phase::Work);
        let result = runner().execute(&ctx);
        assert!(result.success);
        assert_eq!(
            result.phase_statuses.get(&Phase::Prechecks),
            Some(&PhaseStatus::Skipped)
        );
        assert!(!repo.path().join("pre.txt").exists());
        assert!(repo.path().join("work.txt").exists());
    }

    #[test]
    fn timeout_kills_the_phase() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: None,
                work: Some(PhaseSpec::Shell {
                    command: "sleep 30".to_owned(),
                    timeout_ms: Some(100),
                }),
                postchecks: None,
            },
        );
        let started = Instant::now();
        let result = runner().execute(&ctx);
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn preset_abort_flag_cancels_before_work() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: None,
                work: Some(shell("echo x > x.txt")),
                postchecks: None,
            },
        );
        ctx.aborted.store(true, Ordering::SeqCst);
        let result = runner().execute(&ctx);
        assert!(result.canceled);
        assert!(!repo.path().join("x.txt").exists());
    }

    #[test]
    fn agent_phase_without_launcher_fails() {
        let repo = setup_repo();
        let ctx = context(
            repo.path(),
            JobPhases {
                prechecks: None,
                work: Some(PhaseSpec::Agent {
                    instructions: "do something".to_owned(),
                }),
                postchecks: None,
            },
        );
        let result = runner().execute(&ctx);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no agent launcher"));
    }
}
