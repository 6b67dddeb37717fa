//! The per-plan state machine: the only writer of node statuses.
//!
//! Wraps a mutable [`Plan`] and applies validated transitions, bumping the
//! node version and the plan's `state_version` on every mutation. Terminal
//! transitions propagate: a failure blocks still-pending dependents
//! (transitively), a success promotes dependents whose dependencies are
//! now all met.
//!
//! Everything else in the orchestrator treats node status as read-only and
//! goes through [`PlanStateMachine::transition`].

use std::collections::BTreeMap;
use std::fmt;

use convoy_git::GitOid;

use crate::model::types::{now_ms, NodeId};
use crate::model::{NodeStatus, Plan};

// ---------------------------------------------------------------------------
// PlanStatus
// ---------------------------------------------------------------------------

/// The derived status of a whole plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanStatus {
    /// No node has been dispatched yet (and the plan is not paused).
    Pending,
    /// At least one node is scheduled or running.
    Running,
    /// The plan's paused flag is set and nothing is in flight.
    Paused,
    /// Every node succeeded.
    Succeeded,
    /// Every node is terminal and none succeeded.
    Failed,
    /// Every node is terminal; some succeeded, some did not.
    Partial,
    /// Every node was canceled.
    Canceled,
}

impl PlanStatus {
    /// Whether the plan has finished (successfully or not).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Partial | Self::Canceled
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Transition results and errors
// ---------------------------------------------------------------------------

/// One applied status change, including propagated ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedTransition {
    /// The node that changed.
    pub node_id: NodeId,
    /// Status before.
    pub from: NodeStatus,
    /// Status after.
    pub to: NodeStatus,
}

/// Errors from state machine operations.
#[derive(Debug)]
pub enum TransitionError {
    /// The node does not exist in this plan.
    UnknownNode {
        /// The missing node.
        node_id: NodeId,
    },
    /// The requested transition is not in the legal-transition table.
    InvalidTransition {
        /// The node whose transition was refused.
        node_id: NodeId,
        /// Its current status.
        from: NodeStatus,
        /// The refused target status.
        to: NodeStatus,
    },
    /// A dependency has no completed commit yet.
    MissingDependencyCommit {
        /// The node whose bases were requested.
        node_id: NodeId,
        /// The dependency without a commit.
        dependency: NodeId,
    },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode { node_id } => {
                write!(f, "node '{node_id}' does not exist in this plan")
            }
            Self::InvalidTransition { node_id, from, to } => {
                write!(f, "illegal transition for node '{node_id}': {from} → {to}")
            }
            Self::MissingDependencyCommit {
                node_id,
                dependency,
            } => {
                write!(
                    f,
                    "node '{node_id}' needs a completed commit from dependency '{dependency}', which has none"
                )
            }
        }
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// PlanStateMachine
// ---------------------------------------------------------------------------

/// A borrow of one plan with transition authority.
pub struct PlanStateMachine<'a> {
    plan: &'a mut Plan,
}

impl<'a> PlanStateMachine<'a> {
    /// Wrap a plan.
    pub const fn new(plan: &'a mut Plan) -> Self {
        Self { plan }
    }

    /// Whether every dependency of `node_id` has succeeded.
    #[must_use]
    pub fn dependencies_met(&self, node_id: &NodeId) -> bool {
        self.plan.dependencies_met(node_id)
    }

    /// Nodes currently in `ready`, in deterministic (ID) order.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.plan
            .execution
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Ready)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Histogram of node statuses.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<NodeStatus, usize> {
        let mut counts = BTreeMap::new();
        for state in self.plan.execution.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    /// Derive the plan's status from its nodes and paused flag.
    #[must_use]
    pub fn plan_status(&self) -> PlanStatus {
        let states: Vec<NodeStatus> = self
            .plan
            .execution
            .values()
            .map(|s| s.status)
            .collect();
        if states.iter().any(NodeStatus::is_in_flight) {
            return PlanStatus::Running;
        }
        if self.plan.paused {
            return PlanStatus::Paused;
        }
        if states.iter().all(|s| s.is_terminal()) {
            let succeeded = states
                .iter()
                .filter(|s| **s == NodeStatus::Succeeded)
                .count();
            if succeeded == states.len() {
                return PlanStatus::Succeeded;
            }
            if states.iter().all(|s| *s == NodeStatus::Canceled) {
                return PlanStatus::Canceled;
            }
            if succeeded == 0 {
                return PlanStatus::Failed;
            }
            return PlanStatus::Partial;
        }
        PlanStatus::Pending
    }

    /// Apply one validated transition and propagate terminal effects.
    ///
    /// Returns every applied change, the requested one first. Each change
    /// bumps the node's version and the plan version.
    ///
    /// # Errors
    /// [`TransitionError::UnknownNode`] or
    /// [`TransitionError::InvalidTransition`].
    pub fn transition(
        &mut self,
        node_id: &NodeId,
        to: NodeStatus,
    ) -> Result<Vec<AppliedTransition>, TransitionError> {
        let from = self
            .plan
            .execution
            .get(node_id)
            .ok_or_else(|| TransitionError::UnknownNode {
                node_id: node_id.clone(),
            })?
            .status;
        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition {
                node_id: node_id.clone(),
                from,
                to,
            });
        }

        let mut applied = vec![self.apply(node_id, from, to)];

        match to {
            NodeStatus::Succeeded => applied.extend(self.promote_dependents(node_id)),
            NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled => {
                applied.extend(self.block_downstream(node_id));
            }
            _ => {}
        }
        Ok(applied)
    }

    /// Drive every non-terminal node to `canceled`.
    pub fn cancel_all(&mut self) -> Vec<AppliedTransition> {
        let targets: Vec<NodeId> = self
            .plan
            .execution
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        let mut applied = Vec::with_capacity(targets.len());
        for id in targets {
            let from = self.plan.execution[&id].status;
            // Not every status cancels directly (pending → canceled is
            // legal, but a node already canceled by propagation is skipped).
            if from.can_transition_to(NodeStatus::Canceled) {
                applied.push(self.apply(&id, from, NodeStatus::Canceled));
            }
        }
        applied
    }

    /// Put a failed (or terminal) node back to `pending` for a retry.
    ///
    /// Resets only this node; dependencies are untouched.
    ///
    /// # Errors
    /// [`TransitionError::UnknownNode`] if the node does not exist.
    pub fn reset_node_to_pending(&mut self, node_id: &NodeId) -> Result<(), TransitionError> {
        let state = self
            .plan
            .execution
            .get_mut(node_id)
            .ok_or_else(|| TransitionError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        state.reset_for_retry();
        self.plan.bump_version();
        Ok(())
    }

    /// Ordered completed commits of `node_id`'s dependencies: the first is
    /// the worktree base, the rest are merge sources.
    ///
    /// # Errors
    /// [`TransitionError::MissingDependencyCommit`] when a dependency has
    /// not produced a commit.
    pub fn base_commits_for(&self, node_id: &NodeId) -> Result<Vec<GitOid>, TransitionError> {
        let node = self
            .plan
            .nodes
            .get(node_id)
            .ok_or_else(|| TransitionError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        let mut commits = Vec::with_capacity(node.dependencies.len());
        for dep in &node.dependencies {
            let commit = self
                .plan
                .execution
                .get(dep)
                .and_then(|s| s.completed_commit)
                .ok_or_else(|| TransitionError::MissingDependencyCommit {
                    node_id: node_id.clone(),
                    dependency: dep.clone(),
                })?;
            commits.push(commit);
        }
        Ok(commits)
    }

    // -- internals --

    /// Unconditionally apply a status change, stamping timestamps and
    /// bumping versions. Callers have already validated.
    fn apply(&mut self, node_id: &NodeId, from: NodeStatus, to: NodeStatus) -> AppliedTransition {
        if let Some(state) = self.plan.execution.get_mut(node_id) {
            state.status = to;
            match to {
                NodeStatus::Running => state.started_at = Some(now_ms()),
                _ if to.is_terminal() => state.ended_at = Some(now_ms()),
                _ => {}
            }
            if to.is_terminal() {
                state.pid = None;
            }
            state.bump_version();
        }
        self.plan.bump_version();
        AppliedTransition {
            node_id: node_id.clone(),
            from,
            to,
        }
    }

    /// After `node_id` succeeded: promote pending dependents whose
    /// dependencies are now all met.
    fn promote_dependents(&mut self, node_id: &NodeId) -> Vec<AppliedTransition> {
        let dependents: Vec<NodeId> = self
            .plan
            .nodes
            .get(node_id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();
        let mut applied = Vec::new();
        for dependent in dependents {
            let is_pending = self
                .plan
                .execution
                .get(&dependent)
                .is_some_and(|s| s.status == NodeStatus::Pending);
            if is_pending && self.dependencies_met(&dependent) {
                applied.push(self.apply(&dependent, NodeStatus::Pending, NodeStatus::Ready));
            }
        }
        applied
    }

    /// After `node_id` failed/blocked/canceled: block everything downstream
    /// that has not started, transitively.
    fn block_downstream(&mut self, node_id: &NodeId) -> Vec<AppliedTransition> {
        let mut applied = Vec::new();
        let mut worklist: Vec<NodeId> = self
            .plan
            .nodes
            .get(node_id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(dependent) = worklist.pop() {
            let status = self.plan.execution.get(&dependent).map(|s| s.status);
            let blockable = matches!(status, Some(NodeStatus::Pending | NodeStatus::Ready));
            if blockable {
                let from = status.unwrap_or(NodeStatus::Pending);
                applied.push(self.apply(&dependent, from, NodeStatus::Blocked));
                if let Some(node) = self.plan.nodes.get(&dependent) {
                    worklist.extend(node.dependents.iter().cloned());
                }
            }
        }
        applied
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::{JobPhases, JobSpec, NodeKind, PhaseSpec, PlanSpec};
    use crate::model::types::PlanId;
    use std::path::PathBuf;

    fn job(id: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            id: id.to_owned(),
            depends_on: deps.iter().map(|s| (*s).to_owned()).collect(),
            kind: NodeKind::Job(JobPhases {
                prechecks: None,
                work: Some(PhaseSpec::Shell {
                    command: "true".to_owned(),
                    timeout_ms: None,
                }),
                postchecks: None,
            }),
            auto_heal: true,
            expects_no_changes: false,
        }
    }

    fn diamond() -> Plan {
        let spec = PlanSpec {
            name: String::new(),
            jobs: vec![
                job("a", &[]),
                job("b", &["a"]),
                job("c", &["a"]),
                job("d", &["b", "c"]),
            ],
            base_branch: "main".to_owned(),
            target_branch: None,
            max_parallel: 4,
        };
        Plan::build(PlanId::generate(), spec, PathBuf::from("/repo")).unwrap()
    }

    fn id(plan: &Plan, producer: &str) -> NodeId {
        plan.node_id_for(producer).unwrap().clone()
    }

    fn drive_to_succeeded(sm: &mut PlanStateMachine<'_>, node: &NodeId) {
        sm.transition(node, NodeStatus::Ready).ok();
        sm.transition(node, NodeStatus::Scheduled).unwrap();
        sm.transition(node, NodeStatus::Running).unwrap();
        sm.transition(node, NodeStatus::Succeeded).unwrap();
    }

    // -- transitions and propagation --

    #[test]
    fn invalid_transition_is_rejected() {
        let mut plan = diamond();
        let a = id(&plan, "a");
        let mut sm = PlanStateMachine::new(&mut plan);
        let err = sm.transition(&a, NodeStatus::Running).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn success_promotes_ready_dependents() {
        let mut plan = diamond();
        let (a, b, c, d) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "c"), id(&plan, "d"));
        let mut sm = PlanStateMachine::new(&mut plan);
        sm.transition(&a, NodeStatus::Ready).unwrap();
        sm.transition(&a, NodeStatus::Scheduled).unwrap();
        sm.transition(&a, NodeStatus::Running).unwrap();
        let applied = sm.transition(&a, NodeStatus::Succeeded).unwrap();
        // a → succeeded, then b and c promoted.
        assert_eq!(applied.len(), 3);
        assert_eq!(plan.execution[&b].status, NodeStatus::Ready);
        assert_eq!(plan.execution[&c].status, NodeStatus::Ready);
        assert_eq!(plan.execution[&d].status, NodeStatus::Pending);
    }

    #[test]
    fn dependent_with_unmet_deps_is_not_promoted() {
        let mut plan = diamond();
        let (a, b, d) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "d"));
        let mut sm = PlanStateMachine::new(&mut plan);
        drive_to_succeeded(&mut sm, &a);
        sm.transition(&b, NodeStatus::Scheduled).unwrap();
        sm.transition(&b, NodeStatus::Running).unwrap();
        sm.transition(&b, NodeStatus::Succeeded).unwrap();
        // d still waits on c.
        assert_eq!(plan.execution[&d].status, NodeStatus::Pending);
    }

    #[test]
    fn failure_blocks_downstream_transitively() {
        let mut plan = diamond();
        let (a, b, c, d) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "c"), id(&plan, "d"));
        let mut sm = PlanStateMachine::new(&mut plan);
        sm.transition(&a, NodeStatus::Ready).unwrap();
        sm.transition(&a, NodeStatus::Scheduled).unwrap();
        sm.transition(&a, NodeStatus::Running).unwrap();
        let applied = sm.transition(&a, NodeStatus::Failed).unwrap();
        assert_eq!(plan.execution[&b].status, NodeStatus::Blocked);
        assert_eq!(plan.execution[&c].status, NodeStatus::Blocked);
        assert_eq!(plan.execution[&d].status, NodeStatus::Blocked);
        assert_eq!(applied.len(), 4);
    }

    #[test]
    fn running_nodes_are_not_blocked_by_sibling_failure() {
        let mut plan = diamond();
        let (a, b, c) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "c"));
        let mut sm = PlanStateMachine::new(&mut plan);
        drive_to_succeeded(&mut sm, &a);
        sm.transition(&b, NodeStatus::Scheduled).unwrap();
        sm.transition(&b, NodeStatus::Running).unwrap();
        sm.transition(&c, NodeStatus::Scheduled).unwrap();
        sm.transition(&c, NodeStatus::Running).unwrap();
        sm.transition(&c, NodeStatus::Failed).unwrap();
        // b keeps running; only not-yet-started downstream gets blocked.
        assert_eq!(plan.execution[&b].status, NodeStatus::Running);
    }

    #[test]
    fn versions_bump_on_every_transition() {
        let mut plan = diamond();
        let a = id(&plan, "a");
        let plan_v0 = plan.state_version;
        let node_v0 = plan.execution[&a].version;
        let mut sm = PlanStateMachine::new(&mut plan);
        sm.transition(&a, NodeStatus::Ready).unwrap();
        assert!(plan.state_version > plan_v0);
        assert!(plan.execution[&a].version > node_v0);
    }

    // -- readiness and ordering --

    #[test]
    fn ready_nodes_are_sorted_by_id() {
        let mut plan = diamond();
        let (a, b, c) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "c"));
        let mut sm = PlanStateMachine::new(&mut plan);
        drive_to_succeeded(&mut sm, &a);
        let sm = PlanStateMachine::new(&mut plan);
        assert_eq!(sm.ready_nodes(), vec![b, c]);
    }

    #[test]
    fn dependencies_met_tracks_success() {
        let mut plan = diamond();
        let (a, b) = (id(&plan, "a"), id(&plan, "b"));
        {
            let sm = PlanStateMachine::new(&mut plan);
            assert!(sm.dependencies_met(&a));
            assert!(!sm.dependencies_met(&b));
        }
        let mut sm = PlanStateMachine::new(&mut plan);
        drive_to_succeeded(&mut sm, &a);
        assert!(sm.dependencies_met(&b));
    }

    // -- plan status --

    #[test]
    fn plan_status_progression() {
        let mut plan = diamond();
        plan.paused = false;
        let a = id(&plan, "a");
        {
            let sm = PlanStateMachine::new(&mut plan);
            assert_eq!(sm.plan_status(), PlanStatus::Pending);
        }
        {
            let mut sm = PlanStateMachine::new(&mut plan);
            sm.transition(&a, NodeStatus::Ready).unwrap();
            sm.transition(&a, NodeStatus::Scheduled).unwrap();
            assert_eq!(sm.plan_status(), PlanStatus::Running);
        }
        plan.paused = true;
        {
            let sm = PlanStateMachine::new(&mut plan);
            // Scheduled node still counts as running even when paused.
            assert_eq!(sm.plan_status(), PlanStatus::Running);
        }
    }

    #[test]
    fn plan_status_terminal_shapes() {
        // All succeed.
        let mut plan = diamond();
        plan.paused = false;
        let order = ["a", "b", "c", "d"].map(|p| id(&plan, p));
        {
            let mut sm = PlanStateMachine::new(&mut plan);
            for node in &order {
                drive_to_succeeded(&mut sm, node);
            }
            assert_eq!(sm.plan_status(), PlanStatus::Succeeded);
        }

        // Root fails: everything else blocked, no success → failed.
        let mut plan = diamond();
        plan.paused = false;
        let a = id(&plan, "a");
        {
            let mut sm = PlanStateMachine::new(&mut plan);
            sm.transition(&a, NodeStatus::Ready).unwrap();
            sm.transition(&a, NodeStatus::Scheduled).unwrap();
            sm.transition(&a, NodeStatus::Running).unwrap();
            sm.transition(&a, NodeStatus::Failed).unwrap();
            assert_eq!(sm.plan_status(), PlanStatus::Failed);
        }

        // Mixed success and failure → partial.
        let mut plan = diamond();
        plan.paused = false;
        let (a, b, c) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "c"));
        {
            let mut sm = PlanStateMachine::new(&mut plan);
            drive_to_succeeded(&mut sm, &a);
            sm.transition(&b, NodeStatus::Scheduled).unwrap();
            sm.transition(&b, NodeStatus::Running).unwrap();
            sm.transition(&b, NodeStatus::Failed).unwrap();
            sm.transition(&c, NodeStatus::Canceled).unwrap();
            assert_eq!(sm.plan_status(), PlanStatus::Partial);
        }
    }

    #[test]
    fn cancel_all_terminalizes_every_live_node() {
        let mut plan = diamond();
        let a = id(&plan, "a");
        let mut sm = PlanStateMachine::new(&mut plan);
        sm.transition(&a, NodeStatus::Ready).unwrap();
        let applied = sm.cancel_all();
        assert_eq!(applied.len(), 4);
        assert!(plan
            .execution
            .values()
            .all(|s| s.status == NodeStatus::Canceled));
        let sm = PlanStateMachine::new(&mut plan);
        assert_eq!(sm.plan_status(), PlanStatus::Canceled);
    }

    #[test]
    fn cancel_all_is_idempotent() {
        let mut plan = diamond();
        let mut sm = PlanStateMachine::new(&mut plan);
        sm.cancel_all();
        let second = sm.cancel_all();
        assert!(second.is_empty());
    }

    // -- retry reset --

    #[test]
    fn reset_node_to_pending_only_touches_that_node() {
        let mut plan = diamond();
        let (a, b) = (id(&plan, "a"), id(&plan, "b"));
        let mut sm = PlanStateMachine::new(&mut plan);
        drive_to_succeeded(&mut sm, &a);
        sm.transition(&b, NodeStatus::Scheduled).unwrap();
        sm.transition(&b, NodeStatus::Running).unwrap();
        sm.transition(&b, NodeStatus::Failed).unwrap();
        sm.reset_node_to_pending(&b).unwrap();
        assert_eq!(plan.execution[&b].status, NodeStatus::Pending);
        assert_eq!(plan.execution[&a].status, NodeStatus::Succeeded);
    }

    // -- base commits --

    #[test]
    fn base_commits_follow_dependency_order() {
        let mut plan = diamond();
        let (a, b, c, d) = (id(&plan, "a"), id(&plan, "b"), id(&plan, "c"), id(&plan, "d"));
        let oid_b: GitOid = "1111111111111111111111111111111111111111".parse().unwrap();
        let oid_c: GitOid = "2222222222222222222222222222222222222222".parse().unwrap();
        let oid_a: GitOid = "3333333333333333333333333333333333333333".parse().unwrap();
        plan.execution.get_mut(&a).unwrap().completed_commit = Some(oid_a);
        plan.execution.get_mut(&b).unwrap().completed_commit = Some(oid_b);
        plan.execution.get_mut(&c).unwrap().completed_commit = Some(oid_c);
        let sm = PlanStateMachine::new(&mut plan);
        assert_eq!(sm.base_commits_for(&d).unwrap(), vec![oid_b, oid_c]);
    }

    #[test]
    fn base_commits_missing_dependency_commit_errors() {
        let mut plan = diamond();
        let d = id(&plan, "d");
        let sm = PlanStateMachine::new(&mut plan);
        assert!(matches!(
            sm.base_commits_for(&d),
            Err(TransitionError::MissingDependencyCommit { .. })
        ));
    }
}
