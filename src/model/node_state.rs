//! Per-node execution state: statuses, phases, and the attempt history.
//!
//! [`NodeStatus`] is the lifecycle state machine vertex set. Transitions
//! progress strictly forward into one of the terminal states; the complete
//! legal-transition table lives on the enum itself so validation is a
//! table lookup.
//!
//! ```text
//! pending   → ready | blocked | canceled
//! ready     → scheduled | blocked | canceled
//! scheduled → running | failed | canceled
//! running   → succeeded | failed | canceled
//! terminal  → (none)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use convoy_git::GitOid;

use crate::model::types::NodeId;

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

/// The lifecycle status of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies succeeded; eligible for dispatch.
    Ready,
    /// Selected by the scheduler; an executor will pick it up.
    Scheduled,
    /// An executor is driving it.
    Running,
    /// Terminal: produced (or inherited) a commit.
    Succeeded,
    /// Terminal: an attempt failed. Retryable.
    Failed,
    /// Terminal: an upstream dependency failed.
    Blocked,
    /// Terminal: the plan (or node) was canceled.
    Canceled,
}

impl NodeStatus {
    /// Returns `true` for statuses that never transition out.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Blocked | Self::Canceled
        )
    }

    /// The set of statuses this one may legally transition to.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Ready, Self::Blocked, Self::Canceled],
            Self::Ready => &[Self::Scheduled, Self::Blocked, Self::Canceled],
            Self::Scheduled => &[Self::Running, Self::Failed, Self::Canceled],
            Self::Running => &[Self::Succeeded, Self::Failed, Self::Canceled],
            Self::Succeeded | Self::Failed | Self::Blocked | Self::Canceled => &[],
        }
    }

    /// Check whether transitioning to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Statuses that occupy (or are about to occupy) an executor.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One step of a node's end-to-end execution, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Forward integration: merge dependency commits into the worktree.
    MergeFi,
    /// Checks before work.
    Prechecks,
    /// The work itself.
    Work,
    /// The commit step.
    Commit,
    /// Checks after the commit.
    Postchecks,
    /// Reverse integration: merge the completed commit to the target branch.
    MergeRi,
}

impl Phase {
    /// Execution order of all phases.
    pub const ORDER: [Self; 6] = [
        Self::MergeFi,
        Self::Prechecks,
        Self::Work,
        Self::Commit,
        Self::Postchecks,
        Self::MergeRi,
    ];

    /// Whether `self` comes at or after `other` in execution order.
    #[must_use]
    pub fn at_or_after(&self, other: Self) -> bool {
        let pos = |p: Self| Self::ORDER.iter().position(|x| *x == p).unwrap_or(0);
        pos(*self) >= pos(other)
    }

    /// The phases a runner executes (everything the executor itself does
    /// not own).
    #[must_use]
    pub const fn is_runner_phase(&self) -> bool {
        matches!(self, Self::Prechecks | Self::Work | Self::Postchecks)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MergeFi => "merge-fi",
            Self::Prechecks => "prechecks",
            Self::Work => "work",
            Self::Commit => "commit",
            Self::Postchecks => "postchecks",
            Self::MergeRi => "merge-ri",
        };
        f.write_str(s)
    }
}

/// The recorded outcome of one phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// The phase completed.
    Success,
    /// The phase failed.
    Failed,
    /// The phase was not applicable or was resumed past.
    Skipped,
}

// ---------------------------------------------------------------------------
// AttemptRecord
// ---------------------------------------------------------------------------

/// What started an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptTrigger {
    /// The scheduler dispatched the node for the first time.
    Initial,
    /// A user (or the watchdog) requested a retry.
    Retry,
    /// The auto-heal path re-ran a failed phase.
    AutoHeal,
}

/// The outcome of a finished attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt completed the node.
    Succeeded,
    /// The attempt failed.
    Failed,
    /// The attempt observed a cancellation.
    Canceled,
}

/// Aggregated numeric metrics for an attempt (resolver costs, merge
/// timings, runner-reported figures). Keys are freeform, values are summed
/// when merged.
pub type Metrics = BTreeMap<String, u64>;

/// Immutable snapshot written when an attempt terminates.
///
/// Appended to the node's attempt history in strict attempt-number order;
/// never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub number: u32,
    /// What started this attempt.
    pub trigger: AttemptTrigger,
    /// Start wall-clock time (epoch milliseconds).
    pub started_at: u64,
    /// End wall-clock time.
    pub ended_at: u64,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// The phase that failed, for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,
    /// Error text, for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Advisory for attempts that succeeded with something left for the
    /// user (e.g. a stash kept during the target-branch merge).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
    /// Exit code of the failing process, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Description of the work phase actually executed (the healed spec
    /// during auto-heal, the original otherwise).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_used: Option<String>,
    /// The log lines produced during this attempt only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_slice: Vec<String>,
    /// Worktree path used by the attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    /// Base commit of the worktree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<GitOid>,
    /// Commit produced by the attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_commit: Option<GitOid>,
    /// Aggregated metrics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: Metrics,
}

// ---------------------------------------------------------------------------
// NodeExecutionState
// ---------------------------------------------------------------------------

/// Mutable execution state of one node.
///
/// `base_commit` is set exactly once per worktree lifetime: retries on the
/// same worktree preserve it. `attempt_history` is append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecutionState {
    /// Current lifecycle status.
    pub status: NodeStatus,
    /// Per-node monotonic version, bumped on every mutation.
    pub version: u64,
    /// Number of the attempt currently in flight (0 before the first).
    pub attempts: u32,
    /// Start wall-clock time of the current/last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// End wall-clock time of the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    /// The node's worktree, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    /// Commit the worktree was created at. Immutable across retries on the
    /// same worktree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<GitOid>,
    /// Commit produced by this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_commit: Option<GitOid>,
    /// Per-phase outcomes of the current/last attempt.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub phase_statuses: BTreeMap<Phase, PhaseStatus>,
    /// OS process currently executing a phase for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Phase the next attempt resumes from (set by retry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_phase: Option<Phase>,
    /// Dependents that have completed forward integration from this node.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub consumed_by_dependents: BTreeSet<NodeId>,
    /// Whether a leaf's commit has been merged to the target branch.
    #[serde(default)]
    pub merged_to_target: bool,
    /// Append-only attempt history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_history: Vec<AttemptRecord>,
    /// Phases already auto-healed once (auto-heal is one-shot per phase).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub auto_heal_attempted: BTreeSet<Phase>,
    /// Opaque agent session identifier, passed back to the runner on
    /// resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    /// Instructions synthesized for the next retry of an agent work
    /// phase. Consumed by the attempt that runs them; the stored spec is
    /// untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_instructions: Option<String>,
    /// Set when the node was forcibly failed by an operator or the
    /// watchdog.
    #[serde(default)]
    pub force_failed: bool,
}

impl Default for NodeExecutionState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            version: 0,
            attempts: 0,
            started_at: None,
            ended_at: None,
            worktree_path: None,
            base_commit: None,
            completed_commit: None,
            phase_statuses: BTreeMap::new(),
            pid: None,
            resume_from_phase: None,
            consumed_by_dependents: BTreeSet::new(),
            merged_to_target: false,
            attempt_history: Vec::new(),
            auto_heal_attempted: BTreeSet::new(),
            agent_session_id: None,
            retry_instructions: None,
            force_failed: false,
        }
    }
}

impl NodeExecutionState {
    /// Bump the node version.
    pub const fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Append a finished attempt. History stays in strict number order.
    pub fn record_attempt(&mut self, record: AttemptRecord) {
        debug_assert!(
            self.attempt_history
                .last()
                .is_none_or(|last| last.number < record.number),
            "attempt records must be appended in order"
        );
        self.attempt_history.push(record);
        self.bump_version();
    }

    /// Reset transient per-attempt fields for a fresh dispatch, keeping the
    /// worktree, base commit, history, and consumption records.
    pub fn reset_for_retry(&mut self) {
        self.status = NodeStatus::Pending;
        self.pid = None;
        self.ended_at = None;
        self.force_failed = false;
        self.bump_version();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
