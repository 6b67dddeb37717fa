//! The pump loop: a single periodic tick driving every loaded plan.
//!
//! The pump thread is not reentrant — the next tick is only scheduled
//! after the previous one finishes. Each tick:
//!
//! 1. (every tenth tick) runs the liveness watchdog over running nodes;
//! 2. publishes capacity and reads the global budget;
//! 3. per active plan: promotes stuck pending nodes whose dependencies
//!    are met, asks the scheduler for a dispatch set, transitions each
//!    pick to scheduled, and hands it to a node executor thread.
//!
//! External deletions are noticed here too: a plan whose document
//! vanished from disk is canceled and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, PlanHandle};
use crate::events::OrchestratorEvent;
use crate::executor;
use crate::model::types::{now_ms, NodeId, PlanId};
use crate::model::NodeStatus;
use crate::scheduler;
use crate::state_machine::PlanStateMachine;
use crate::watchdog;

/// Ticks between liveness sweeps.
const WATCHDOG_CADENCE: u64 = 10;

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Handle to the running pump thread.
pub struct Pump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Pump {
    /// Start the pump thread.
    #[must_use]
    pub fn start(engine: Arc<Engine>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = Duration::from_millis(engine.config.pump_interval_ms.max(10));
        let thread = std::thread::Builder::new()
            .name("convoy-pump".to_owned())
            .spawn(move || {
                let mut tick_number: u64 = 0;
                while !stop_flag.load(Ordering::SeqCst) {
                    tick_number += 1;
                    tick(&engine, tick_number);
                    std::thread::sleep(interval);
                }
                debug!("pump stopped");
            })
            .ok();
        Self { stop, thread }
    }

    /// Stop the pump and wait for the in-flight tick to finish. Node
    /// executors already dispatched keep running.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One pump tick. Public within the crate so tests (and the orchestrator's
/// synchronous drive mode) can tick without a thread.
pub(crate) fn tick(engine: &Arc<Engine>, tick_number: u64) {
    let handles = engine.handles();

    if tick_number % WATCHDOG_CADENCE == 1 {
        for (plan_id, handle) in &handles {
            liveness_sweep(engine, *plan_id, handle);
        }
    }

    // Capacity: local running count across every plan, published for
    // cross-process coordination.
    let mut local_running = 0usize;
    let mut active_plans: Vec<PlanId> = Vec::new();
    for (plan_id, handle) in &handles {
        let plan = handle.lock_plan();
        let running = plan
            .execution
            .iter()
            .filter(|(id, s)| {
                s.status.is_in_flight()
                    && plan.nodes.get(*id).is_some_and(crate::model::plan::Node::is_work_performing)
            })
            .count();
        if running > 0 {
            active_plans.push(*plan_id);
        }
        local_running += running;
    }
    engine.capacity.publish(local_running, &active_plans);
    engine.update_wake_lock(local_running > 0);

    for (plan_id, handle) in handles {
        pump_plan(engine, plan_id, &handle);
    }
}

/// Fail running nodes whose tracked process has died.
fn liveness_sweep(engine: &Arc<Engine>, plan_id: PlanId, handle: &Arc<PlanHandle>) {
    let dead: Vec<NodeId> = {
        let plan = handle.lock_plan();
        plan.execution
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Running)
            .filter_map(|(id, s)| {
                s.pid
                    .filter(|pid| !watchdog::process_alive(*pid))
                    .map(|_| id.clone())
            })
            .collect()
    };
    for node_id in dead {
        warn!(plan = %plan_id, node = %node_id, "tracked process died, failing node");
        let mut plan = handle.lock_plan();
        if let Some(state) = plan.state_mut(&node_id) {
            state.pid = None;
        }
        let mut sm = PlanStateMachine::new(&mut plan);
        match sm.transition(&node_id, NodeStatus::Failed) {
            Ok(applied) => {
                engine.emit_transitions(plan_id, &applied, Some("process died"));
            }
            Err(e) => warn!(node = %node_id, error = %e, "could not fail dead node"),
        }
        engine.persist(&plan);
        drop(plan);
        engine.emit(&OrchestratorEvent::NodeCompleted {
            plan_id,
            node_id,
            success: false,
        });
    }
}

/// Schedule and dispatch one plan for one tick.
fn pump_plan(engine: &Arc<Engine>, plan_id: PlanId, handle: &Arc<PlanHandle>) {
    // External deletion: the document vanished from under us.
    if !engine.store.layout().plan_doc(plan_id).exists() {
        let existed = engine.remove_handle(plan_id).is_some();
        if existed {
            warn!(plan = %plan_id, "plan document vanished, dropping plan");
            handle.abort_all();
            let mut plan = handle.lock_plan();
            let mut sm = PlanStateMachine::new(&mut plan);
            sm.cancel_all();
            drop(plan);
            engine.logs.forget_plan(plan_id);
            engine.emit(&OrchestratorEvent::PlanDeleted { plan_id });
        }
        return;
    }

    let selected = {
        let mut plan = handle.lock_plan();
        if plan.paused {
            return;
        }
        {
            let sm = PlanStateMachine::new(&mut plan);
            if sm.plan_status().is_terminal() {
                drop(sm);
                finish_plan_if_needed(engine, &mut plan);
                return;
            }
        }

        safety_sweep(engine, &mut plan);

        let selected = scheduler::select_nodes(&plan, engine.capacity.budget());
        if selected.is_empty() {
            return;
        }

        // First dispatch stamps the plan start.
        if plan.started_at.is_none() {
            plan.started_at = Some(now_ms());
            plan.bump_version();
            engine.emit(&OrchestratorEvent::PlanStarted { plan_id });
        }

        let mut sm = PlanStateMachine::new(&mut plan);
        let mut dispatched = Vec::with_capacity(selected.len());
        for node_id in selected {
            match sm.transition(&node_id, NodeStatus::Scheduled) {
                Ok(applied) => {
                    engine.emit_transitions(plan_id, &applied, None);
                    dispatched.push(node_id);
                }
                Err(e) => warn!(node = %node_id, error = %e, "could not schedule node"),
            }
        }
        engine.persist(&plan);
        dispatched
    };

    for node_id in selected {
        debug!(plan = %plan_id, node = %node_id, "dispatching node");
        let engine = Arc::clone(engine);
        let handle = Arc::clone(handle);
        let spawned = std::thread::Builder::new()
            .name(format!("convoy-node-{node_id}"))
            .spawn(move || executor::execute_node(&engine, &handle, &node_id));
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn executor thread");
        }
    }
}

/// Promote nodes stuck in pending whose dependencies are met (crash
/// between a dependency's success and the promotion it should have
/// caused).
fn safety_sweep(engine: &Arc<Engine>, plan: &mut crate::model::Plan) {
    let plan_id = plan.id;
    let stuck: Vec<NodeId> = plan
        .execution
        .iter()
        .filter(|(_, s)| s.status == NodeStatus::Pending)
        .filter(|(id, _)| plan.dependencies_met(id))
        .map(|(id, _)| id.clone())
        .collect();
    if stuck.is_empty() {
        return;
    }
    let mut sm = PlanStateMachine::new(plan);
    for node_id in stuck {
        match sm.transition(&node_id, NodeStatus::Ready) {
            Ok(applied) => {
                debug!(node = %node_id, "safety sweep promoted stuck node");
                engine.emit_transitions(plan_id, &applied, Some("safety sweep"));
            }
            Err(e) => warn!(node = %node_id, error = %e, "safety sweep promotion failed"),
        }
    }
}

/// Stamp the end time and emit completion when a plan just went terminal.
fn finish_plan_if_needed(engine: &Arc<Engine>, plan: &mut crate::model::Plan) {
    if plan.ended_at.is_some() {
        return;
    }
    plan.ended_at = Some(now_ms());
    plan.bump_version();
    let status = PlanStateMachine::new(plan).plan_status();
    engine.persist(plan);
    info!(plan = %plan.id, %status, "plan completed");
    engine.emit(&OrchestratorEvent::PlanCompleted {
        plan_id: plan.id,
        status,
    });
}
