//! Dispatch selection: a pure function of plan state and capacity.
//!
//! The scheduler owns no state and performs no I/O. Given the ready set,
//! the plan's in-flight count, and the global running count, it picks the
//! nodes to dispatch this tick: bottlenecks first (most dependents), node
//! ID as the deterministic tie-break.

use crate::model::plan::Node;
use crate::model::types::NodeId;
use crate::model::{NodeStatus, Plan};

/// Capacity inputs for one scheduling decision.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleBudget {
    /// Work-performing nodes running or scheduled across all plans in all
    /// cooperating processes.
    pub global_running: usize,
    /// The global ceiling.
    pub global_max: usize,
}

/// Select the nodes to dispatch from `plan` under `budget`.
///
/// Only work-performing nodes count toward the running totals, but every
/// selected node — coordination included — consumes a slot of this tick's
/// dispatch ceiling, so the selection length never exceeds it.
#[must_use]
pub fn select_nodes(plan: &Plan, budget: ScheduleBudget) -> Vec<NodeId> {
    // BTreeMap iteration gives the ready set in ID order.
    let mut ready: Vec<NodeId> = plan
        .execution
        .iter()
        .filter(|(_, s)| s.status == NodeStatus::Ready)
        .map(|(id, _)| id.clone())
        .collect();
    if ready.is_empty() {
        return Vec::new();
    }

    let plan_running = plan
        .execution
        .iter()
        .filter(|(id, s)| {
            s.status.is_in_flight() && plan.nodes.get(*id).is_some_and(Node::is_work_performing)
        })
        .count();

    let plan_available = plan.spec.max_parallel.saturating_sub(plan_running);
    let global_available = budget.global_max.saturating_sub(budget.global_running);
    let available = plan_available.min(global_available);
    if available == 0 {
        return Vec::new();
    }

    // Bottlenecks first: nodes unblocking the most dependents. The ready
    // set arrives ID-sorted, so an equal-dependents tie stays
    // deterministic under the stable sort.
    ready.sort_by_key(|id| {
        std::cmp::Reverse(plan.nodes.get(id).map_or(0, |n| n.dependents.len()))
    });
    ready.truncate(available);
    ready
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
