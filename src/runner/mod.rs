//! The work runner contract.
//!
//! A [`JobExecutor`] executes the runner phases (prechecks, work,
//! postchecks) of one node inside its worktree and reports a structured
//! result. The orchestrator core never runs phases itself; it hands the
//! node to whichever executor was injected — the reference shell executor
//! in [`shell`], or an external integration.

pub mod shell;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use convoy_git::GitOid;

use crate::logs::LogLevel;
use crate::model::types::{NodeId, PlanId};
use crate::model::{JobPhases, Metrics, Phase, PhaseStatus};

pub use shell::{AgentLauncher, AgentOutcome, ShellJobExecutor, UnsupportedAgentLauncher};

// ---------------------------------------------------------------------------
// Runner events
// ---------------------------------------------------------------------------

/// Callbacks a runner uses to report progress while executing.
///
/// Implemented by the node executor; every call is safe to make from the
/// runner's own threads.
pub trait RunnerEvents: Send + Sync {
    /// A log line produced by a phase.
    fn on_log(&self, phase: Phase, level: LogLevel, message: &str);

    /// A phase finished with the given status.
    fn on_phase_status(&self, phase: Phase, status: PhaseStatus);

    /// The OS process currently executing changed (`None` when it exited).
    fn on_pid(&self, pid: Option<u32>);
}

/// A no-op event sink for tests.
pub struct NullRunnerEvents;

impl RunnerEvents for NullRunnerEvents {
    fn on_log(&self, _phase: Phase, _level: LogLevel, _message: &str) {}
    fn on_phase_status(&self, _phase: Phase, _status: PhaseStatus) {}
    fn on_pid(&self, _pid: Option<u32>) {}
}

// ---------------------------------------------------------------------------
// Context and result
// ---------------------------------------------------------------------------

/// Everything a runner needs to execute one attempt of one node.
pub struct ExecutionContext {
    /// The plan being executed.
    pub plan_id: PlanId,
    /// The node being executed.
    pub node_id: NodeId,
    /// The worktree's base commit.
    pub base_commit: GitOid,
    /// The worktree the phases run in.
    pub worktree_path: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Skip phases before this one (set on retry and auto-heal).
    pub resume_from_phase: Option<Phase>,
    /// Phase outcomes from the previous attempt, for resume decisions.
    pub previous_phase_statuses: BTreeMap<Phase, PhaseStatus>,
    /// Agent session to resume, when the runner supports it.
    pub agent_session_id: Option<String>,
    /// The phase specs to execute. During auto-heal this carries the
    /// temporarily swapped spec.
    pub phases: JobPhases,
    /// Cooperative cancellation flag, checked at phase boundaries and
    /// while waiting on processes.
    pub aborted: Arc<AtomicBool>,
    /// Progress callbacks.
    pub events: Arc<dyn RunnerEvents>,
}

/// The structured outcome of one runner invocation.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    /// Whether every executed phase succeeded.
    pub success: bool,
    /// The attempt observed a cancellation and stopped early.
    pub canceled: bool,
    /// Commit produced by the work (unset when the phases made no commit).
    pub completed_commit: Option<GitOid>,
    /// The phase that failed, when `success` is false.
    pub failed_phase: Option<Phase>,
    /// Exit code of the failing process, when one exists.
    pub exit_code: Option<i32>,
    /// Error description, when `success` is false.
    pub error: Option<String>,
    /// Outcome per executed (or skipped) phase.
    pub phase_statuses: BTreeMap<Phase, PhaseStatus>,
    /// Agent session identifier to carry to the next attempt.
    pub agent_session_id: Option<String>,
    /// The last OS process the runner spawned.
    pub pid: Option<u32>,
    /// Runner-reported metrics.
    pub metrics: Metrics,
}

impl ExecutionResult {
    /// A canceled result with whatever statuses were gathered so far.
    #[must_use]
    pub fn canceled(phase_statuses: BTreeMap<Phase, PhaseStatus>) -> Self {
        Self {
            canceled: true,
            phase_statuses,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

/// The work runner contract.
///
/// Implementations must be safe to call from multiple executor threads
/// concurrently (one call per node).
pub trait JobExecutor: Send + Sync {
    /// Execute the runner phases of one node attempt.
    fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult;

    /// Best-effort cancellation of an in-flight execution. The cooperative
    /// `aborted` flag is set by the caller before this is invoked.
    fn cancel(&self, _plan_id: PlanId, _node_id: &NodeId) {}
}
