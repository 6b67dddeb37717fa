//! Shared runtime state wired through every orchestrator component.
//!
//! [`Engine`] holds the injected capabilities (store, git gateway, work
//! runner, conflict resolver, event sink) and the in-memory plan registry.
//! Per-plan mutable state lives behind a [`PlanHandle`]: the plan mutex
//! serializes every status transition, and the abort map carries the
//! cooperative cancellation flags of in-flight nodes.
//!
//! Locks are held only across in-memory mutation; no git or process I/O
//! happens under a plan lock.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use convoy_git::GitGateway;

use crate::capacity::CapacityCoordinator;
use crate::config::ConvoyConfig;
use crate::events::{EventSink, OrchestratorEvent};
use crate::logs::LogStore;
use crate::model::types::{NodeId, PlanId};
use crate::model::Plan;
use crate::resolver::ConflictResolver;
use crate::ri_lock::RiSerializer;
use crate::runner::JobExecutor;
use crate::state_machine::AppliedTransition;
use crate::store::PlanStore;

// ---------------------------------------------------------------------------
// WakeLock
// ---------------------------------------------------------------------------

/// Keeps the host awake while plans are running.
///
/// Platform integrations (systemd inhibitors, caffeinate, SetThreadExecutionState)
/// implement this; the default does nothing.
pub trait WakeLock: Send + Sync {
    /// Called when the first plan starts running.
    fn acquire(&self);
    /// Called when the last running plan stops.
    fn release(&self);
}

/// The default wake lock: a no-op.
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

// ---------------------------------------------------------------------------
// PlanHandle
// ---------------------------------------------------------------------------

/// One loaded plan plus its in-flight execution bookkeeping.
pub struct PlanHandle {
    plan: Mutex<Plan>,
    aborts: Mutex<BTreeMap<NodeId, Arc<AtomicBool>>>,
}

impl PlanHandle {
    /// Wrap a plan.
    #[must_use]
    pub fn new(plan: Plan) -> Self {
        Self {
            plan: Mutex::new(plan),
            aborts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Lock the plan. Poisoning is recovered: plan state is kept
    /// consistent by the state machine, not by panic-freedom.
    pub fn lock_plan(&self) -> MutexGuard<'_, Plan> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cancellation flag for a node, creating it on first use.
    #[must_use]
    pub fn abort_flag(&self, node_id: &NodeId) -> Arc<AtomicBool> {
        let mut aborts = self.aborts.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            aborts
                .entry(node_id.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Set every known abort flag (plan-wide cancel).
    pub fn abort_all(&self) {
        let aborts = self.aborts.lock().unwrap_or_else(PoisonError::into_inner);
        for flag in aborts.values() {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Drop a node's abort flag after its executor finished.
    pub fn clear_abort(&self, node_id: &NodeId) {
        let mut aborts = self.aborts.lock().unwrap_or_else(PoisonError::into_inner);
        aborts.remove(node_id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The orchestrator's shared runtime: injected capabilities plus the plan
/// registry.
pub struct Engine {
    /// Static configuration.
    pub config: ConvoyConfig,
    /// Durable store.
    pub store: PlanStore,
    /// Execution logs.
    pub logs: LogStore,
    /// Git gateway.
    pub git: Arc<dyn GitGateway>,
    /// Work runner.
    pub runner: Arc<dyn JobExecutor>,
    /// Conflict resolver.
    pub resolver: Arc<dyn ConflictResolver>,
    /// Event sink.
    pub events: Arc<dyn EventSink>,
    /// Reverse-integration serializer.
    pub ri_lock: RiSerializer,
    /// Capacity coordination.
    pub capacity: CapacityCoordinator,
    /// Host wake lock.
    pub wake_lock: Arc<dyn WakeLock>,
    wake_held: AtomicBool,
    /// Loaded plans.
    plans: Mutex<BTreeMap<PlanId, Arc<PlanHandle>>>,
}

impl Engine {
    /// Assemble an engine from its parts.
    #[must_use]
    pub fn new(
        config: ConvoyConfig,
        store: PlanStore,
        git: Arc<dyn GitGateway>,
        runner: Arc<dyn JobExecutor>,
        resolver: Arc<dyn ConflictResolver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let capacity = CapacityCoordinator::new(config.max_parallel);
        let logs = LogStore::new(store.clone());
        Self {
            config,
            store,
            logs,
            git,
            runner,
            resolver,
            events,
            ri_lock: RiSerializer::new(),
            capacity,
            wake_lock: Arc::new(NoopWakeLock),
            wake_held: AtomicBool::new(false),
            plans: Mutex::new(BTreeMap::new()),
        }
    }

    /// Track whether any plan is running, acquiring or releasing the wake
    /// lock on edges.
    pub fn update_wake_lock(&self, any_running: bool) {
        let was = self.wake_held.swap(any_running, std::sync::atomic::Ordering::SeqCst);
        if any_running && !was {
            self.wake_lock.acquire();
        } else if !any_running && was {
            self.wake_lock.release();
        }
    }

    /// Look up a loaded plan.
    #[must_use]
    pub fn handle(&self, plan_id: PlanId) -> Option<Arc<PlanHandle>> {
        let plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        plans.get(&plan_id).cloned()
    }

    /// All loaded plan handles, by ID.
    #[must_use]
    pub fn handles(&self) -> Vec<(PlanId, Arc<PlanHandle>)> {
        let plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        plans
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }

    /// Register a plan handle.
    pub fn insert_handle(&self, plan_id: PlanId, handle: Arc<PlanHandle>) {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        plans.insert(plan_id, handle);
    }

    /// Remove a plan handle (delete or external disappearance).
    pub fn remove_handle(&self, plan_id: PlanId) -> Option<Arc<PlanHandle>> {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        plans.remove(&plan_id)
    }

    /// Persist a plan, logging (not raising) failures: persistence errors
    /// on the hot path must not take down executors, and the next tick
    /// retries.
    pub fn persist(&self, plan: &Plan) {
        if let Err(e) = self.store.write_plan(plan) {
            warn!(plan = %plan.id, error = %e, "failed to persist plan");
        }
    }

    /// Publish one event.
    pub fn emit(&self, event: &OrchestratorEvent) {
        self.events.emit(event);
    }

    /// Publish a batch of applied transitions as events.
    pub fn emit_transitions(
        &self,
        plan_id: PlanId,
        applied: &[AppliedTransition],
        reason: Option<&str>,
    ) {
        for transition in applied {
            self.emit(&OrchestratorEvent::NodeTransition {
                plan_id,
                node_id: transition.node_id.clone(),
                from: transition.from,
                to: transition.to,
                reason: reason.map(str::to_owned),
            });
        }
    }
}
