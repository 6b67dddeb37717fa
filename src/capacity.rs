//! The capacity coordinator: per-plan and global concurrency ceilings.
//!
//! Per-plan ceilings live on the plan spec; this module owns the global
//! ceiling and, optionally, a cross-process registry. Each pump publishes
//! its local running count and active plan IDs; the coordinator answers
//! with the global sum. In single-process mode it simply mirrors the
//! local count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::model::types::PlanId;
use crate::scheduler::ScheduleBudget;

// ---------------------------------------------------------------------------
// Cross-process registry
// ---------------------------------------------------------------------------

/// Optional cross-process capacity sharing.
///
/// Implementations typically back onto a shared file or a local socket;
/// the coordinator only needs publish and sum.
pub trait CapacityRegistry: Send + Sync {
    /// Publish this process's current running count and active plans.
    fn publish(&self, process_id: &str, running: usize, active_plans: &[PlanId]);

    /// The running count summed across all publishing processes.
    fn global_running(&self) -> usize;
}

// ---------------------------------------------------------------------------
// CapacityCoordinator
// ---------------------------------------------------------------------------

/// Tracks local running work and answers capacity questions.
pub struct CapacityCoordinator {
    global_max: usize,
    local_running: AtomicUsize,
    registry: Option<Arc<dyn CapacityRegistry>>,
    process_id: String,
}

impl CapacityCoordinator {
    /// A single-process coordinator.
    #[must_use]
    pub fn new(global_max: usize) -> Self {
        Self {
            global_max,
            local_running: AtomicUsize::new(0),
            registry: None,
            process_id: format!("convoy-{}", std::process::id()),
        }
    }

    /// A coordinator that shares counts through `registry`.
    #[must_use]
    pub fn with_registry(global_max: usize, registry: Arc<dyn CapacityRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new(global_max)
        }
    }

    /// The global ceiling.
    #[must_use]
    pub const fn global_max(&self) -> usize {
        self.global_max
    }

    /// Publish the local running count (and active plans) for this tick.
    pub fn publish(&self, running: usize, active_plans: &[PlanId]) {
        self.local_running.store(running, Ordering::SeqCst);
        if let Some(registry) = &self.registry {
            registry.publish(&self.process_id, running, active_plans);
        }
    }

    /// The global running count: the registry's sum when one is plugged
    /// in, the local mirror otherwise.
    #[must_use]
    pub fn global_running(&self) -> usize {
        self.registry.as_ref().map_or_else(
            || self.local_running.load(Ordering::SeqCst),
            |registry| registry.global_running(),
        )
    }

    /// The budget handed to the scheduler this tick.
    #[must_use]
    pub fn budget(&self) -> ScheduleBudget {
        ScheduleBudget {
            global_running: self.global_running(),
            global_max: self.global_max,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
