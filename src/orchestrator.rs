//! Plan lifecycle: the public orchestrator facade.
//!
//! Owns the engine, loads plans at startup (running crash recovery before
//! the pump starts), and exposes create / pause / resume / cancel /
//! delete plus the retry and force-fail APIs. All heavy lifting happens
//! in the pump and the node executors; this module is bookkeeping and
//! policy.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use convoy_git::{CliGateway, GitGateway};

use crate::config::ConvoyConfig;
use crate::engine::{Engine, PlanHandle};
use crate::error::ConvoyError;
use crate::events::{EventSink, NullEventSink, OrchestratorEvent};
use crate::model::types::{NodeId, PlanId};
use crate::model::{NodeStatus, Phase, PhaseSpec, Plan, PlanSpec};
use crate::pump::Pump;
use crate::resolver::{ConflictResolver, UnresolvingResolver};
use crate::runner::{JobExecutor, ShellJobExecutor};
use crate::state_machine::{PlanStateMachine, PlanStatus};
use crate::store::PlanStore;
use crate::watchdog;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`PlanOrchestrator`] with injectable collaborators.
pub struct OrchestratorBuilder {
    config: ConvoyConfig,
    git: Option<Arc<dyn GitGateway>>,
    runner: Option<Arc<dyn JobExecutor>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    events: Option<Arc<dyn EventSink>>,
}

impl OrchestratorBuilder {
    /// Start from a configuration.
    #[must_use]
    pub const fn new(config: ConvoyConfig) -> Self {
        Self {
            config,
            git: None,
            runner: None,
            resolver: None,
            events: None,
        }
    }

    /// Use a custom git gateway.
    #[must_use]
    pub fn git(mut self, git: Arc<dyn GitGateway>) -> Self {
        self.git = Some(git);
        self
    }

    /// Use a custom work runner.
    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn JobExecutor>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Use a custom conflict resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use a custom event sink.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Open the store and assemble the orchestrator. The pump is not
    /// started; call [`PlanOrchestrator::initialize`].
    ///
    /// # Errors
    /// Fails when the storage root cannot be created.
    pub fn build(self) -> Result<PlanOrchestrator, ConvoyError> {
        let store = PlanStore::open(self.config.storage_path.clone())?;
        let git = self
            .git
            .unwrap_or_else(|| Arc::new(CliGateway::new()) as Arc<dyn GitGateway>);
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ShellJobExecutor::new(Arc::clone(&git))) as _);
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(UnresolvingResolver) as _);
        let events = self.events.unwrap_or_else(|| Arc::new(NullEventSink) as _);
        let engine = Arc::new(Engine::new(
            self.config, store, git, runner, resolver, events,
        ));
        Ok(PlanOrchestrator {
            engine,
            pump: Mutex::new(None),
        })
    }
}

// ---------------------------------------------------------------------------
// RetryOptions
// ---------------------------------------------------------------------------

/// Options for [`PlanOrchestrator::retry_node`].
#[derive(Clone, Debug, Default)]
pub struct RetryOptions {
    /// Replacement prechecks spec.
    pub new_prechecks: Option<PhaseSpec>,
    /// Replacement work spec.
    pub new_work: Option<PhaseSpec>,
    /// Replacement postchecks spec.
    pub new_postchecks: Option<PhaseSpec>,
    /// Reset the worktree to the base commit before the retry.
    pub clear_worktree: bool,
}

impl RetryOptions {
    const fn has_new_spec(&self) -> bool {
        self.new_prechecks.is_some() || self.new_work.is_some() || self.new_postchecks.is_some()
    }
}

/// Log bytes embedded in synthesized agent retry instructions.
const RETRY_LOG_BYTES: usize = 2048;

// ---------------------------------------------------------------------------
// PlanOrchestrator
// ---------------------------------------------------------------------------

/// The public orchestrator handle.
pub struct PlanOrchestrator {
    engine: Arc<Engine>,
    pump: Mutex<Option<Pump>>,
}

impl PlanOrchestrator {
    /// Build with all-default collaborators.
    ///
    /// # Errors
    /// Fails when the storage root cannot be created.
    pub fn new(config: ConvoyConfig) -> Result<Self, ConvoyError> {
        OrchestratorBuilder::new(config).build()
    }

    /// The shared engine (tests and embedders).
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Startup / shutdown
    // -----------------------------------------------------------------------

    /// Load persisted plans, run crash recovery, and start the pump.
    ///
    /// Unreadable plan documents are skipped with a warning — one corrupt
    /// plan must not take the process down.
    ///
    /// # Errors
    /// Fails only when the store cannot be listed at all.
    pub fn initialize(&self) -> Result<(), ConvoyError> {
        let ids = self.engine.store.list_plan_ids()?;
        for plan_id in ids {
            match self.engine.store.read_plan(plan_id) {
                Ok(Some(plan)) => {
                    let handle = Arc::new(PlanHandle::new(plan));
                    recover_crashed_nodes(&self.engine, plan_id, &handle);
                    self.engine.insert_handle(plan_id, handle);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plan = %plan_id, error = %e, "skipping unreadable plan document");
                }
            }
        }
        self.start_pump();
        Ok(())
    }

    /// Start the pump if it is not running.
    pub fn start_pump(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_none() {
            *pump = Some(Pump::start(Arc::clone(&self.engine)));
        }
    }

    /// Stop the pump. In-flight node executors finish on their own.
    pub fn shutdown(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut running) = pump.take() {
            running.stop();
        }
    }

    // -----------------------------------------------------------------------
    // Plan lifecycle
    // -----------------------------------------------------------------------

    /// Create a plan (paused) from a spec and persist it.
    ///
    /// # Errors
    /// Spec validation and store failures propagate.
    pub fn create_plan(
        &self,
        spec: PlanSpec,
        repo_path: Option<PathBuf>,
    ) -> Result<PlanId, ConvoyError> {
        let repo = repo_path
            .or_else(|| self.engine.config.default_repo_path.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let plan_id = PlanId::generate();
        let plan = Plan::build(plan_id, spec, repo)?;

        // Persist the phase specs into the per-node spec tree.
        for node in plan.nodes.values() {
            if let Some(phases) = node.kind.phases() {
                self.engine
                    .store
                    .write_node_phases(plan_id, &node.id, phases)?;
            }
        }
        self.engine.store.write_plan(&plan)?;
        self.engine
            .insert_handle(plan_id, Arc::new(PlanHandle::new(plan)));
        self.engine.emit(&OrchestratorEvent::PlanCreated { plan_id });
        info!(plan = %plan_id, "plan created");
        Ok(plan_id)
    }

    /// Unpause a plan; the next tick will drive its ready roots.
    ///
    /// # Errors
    /// [`ConvoyError::PlanNotFound`].
    pub fn resume_plan(&self, plan_id: PlanId) -> Result<(), ConvoyError> {
        let handle = self.handle(plan_id)?;
        let mut plan = handle.lock_plan();
        if plan.paused {
            plan.paused = false;
            plan.bump_version();
            // Roots become ready on resume; later readiness flows from
            // transitions.
            let stuck: Vec<NodeId> = plan
                .execution
                .iter()
                .filter(|(_, s)| s.status == NodeStatus::Pending)
                .filter(|(id, _)| plan.dependencies_met(id))
                .map(|(id, _)| id.clone())
                .collect();
            let mut sm = PlanStateMachine::new(&mut plan);
            for node_id in stuck {
                if let Ok(applied) = sm.transition(&node_id, NodeStatus::Ready) {
                    self.engine.emit_transitions(plan_id, &applied, None);
                }
            }
            self.engine.persist(&plan);
        }
        Ok(())
    }

    /// Pause a plan: nothing new is dispatched; running nodes finish.
    ///
    /// # Errors
    /// [`ConvoyError::PlanNotFound`].
    pub fn pause_plan(&self, plan_id: PlanId) -> Result<(), ConvoyError> {
        let handle = self.handle(plan_id)?;
        let mut plan = handle.lock_plan();
        if !plan.paused {
            plan.paused = true;
            plan.bump_version();
            self.engine.persist(&plan);
        }
        Ok(())
    }

    /// Cancel a plan: cooperative aborts, process-tree kills, and a
    /// terminal transition for every live node. Idempotent.
    ///
    /// # Errors
    /// [`ConvoyError::PlanNotFound`].
    pub fn cancel_plan(&self, plan_id: PlanId) -> Result<(), ConvoyError> {
        let handle = self.handle(plan_id)?;
        handle.abort_all();
        self.engine.runner_cancel_all(plan_id, &handle);

        let mut plan = handle.lock_plan();
        let pids: Vec<u32> = plan.execution.values().filter_map(|s| s.pid).collect();
        for pid in pids {
            watchdog::kill_process_tree(pid);
        }
        let mut sm = PlanStateMachine::new(&mut plan);
        let applied = sm.cancel_all();
        self.engine
            .emit_transitions(plan_id, &applied, Some("plan canceled"));
        self.engine.persist(&plan);
        drop(plan);
        if !applied.is_empty() {
            info!(plan = %plan_id, canceled = applied.len(), "plan canceled");
        }
        Ok(())
    }

    /// Delete a plan. Implies cancel; in-memory state is cleared first,
    /// then disk best-effort. Idempotent.
    ///
    /// # Errors
    /// Store failures propagate; a missing plan is a no-op.
    pub fn delete_plan(&self, plan_id: PlanId) -> Result<(), ConvoyError> {
        if let Ok(handle) = self.handle(plan_id) {
            self.cancel_plan(plan_id)?;
            // Reclaim any worktrees the plan still owns.
            let (repo, worktrees): (PathBuf, Vec<PathBuf>) = {
                let plan = handle.lock_plan();
                (
                    plan.repo_path.clone(),
                    plan.execution
                        .values()
                        .filter_map(|s| s.worktree_path.clone())
                        .collect(),
                )
            };
            for worktree in worktrees {
                if let Err(e) = self.engine.git.remove_worktree_safe(&repo, &worktree) {
                    warn!(plan = %plan_id, error = %e, "could not remove worktree during delete");
                }
            }
        }
        self.engine.remove_handle(plan_id);
        self.engine.logs.forget_plan(plan_id);
        self.engine.store.delete_plan(plan_id)?;
        self.engine.emit(&OrchestratorEvent::PlanDeleted { plan_id });
        info!(plan = %plan_id, "plan deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// IDs of every loaded plan.
    #[must_use]
    pub fn plan_ids(&self) -> Vec<PlanId> {
        self.engine.handles().into_iter().map(|(id, _)| id).collect()
    }

    /// A point-in-time copy of a plan.
    ///
    /// # Errors
    /// [`ConvoyError::PlanNotFound`].
    pub fn plan_snapshot(&self, plan_id: PlanId) -> Result<Plan, ConvoyError> {
        let handle = self.handle(plan_id)?;
        let plan = handle.lock_plan();
        Ok(plan.clone())
    }

    /// The derived status of a plan.
    ///
    /// # Errors
    /// [`ConvoyError::PlanNotFound`].
    pub fn plan_status(&self, plan_id: PlanId) -> Result<PlanStatus, ConvoyError> {
        let handle = self.handle(plan_id)?;
        let mut plan = handle.lock_plan();
        Ok(PlanStateMachine::new(&mut plan).plan_status())
    }

    /// Block until the plan reaches a terminal status or the timeout
    /// elapses. Returns the last observed status.
    ///
    /// # Errors
    /// [`ConvoyError::PlanNotFound`].
    pub fn wait_for_completion(
        &self,
        plan_id: PlanId,
        timeout: Duration,
    ) -> Result<PlanStatus, ConvoyError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.plan_status(plan_id)?;
            if status.is_terminal() || Instant::now() >= deadline {
                return Ok(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    // -----------------------------------------------------------------------
    // Retry / force-fail
    // -----------------------------------------------------------------------

    /// Queue a failed node for another attempt.
    ///
    /// Resume point selection: a new prechecks/work spec (or a worktree
    /// clear) restarts from the earliest changed phase; a postchecks-only
    /// change resumes at postchecks when that is where the failure was;
    /// otherwise the retry resumes at the last failed phase, preserving
    /// earlier phase results.
    ///
    /// # Errors
    /// [`ConvoyError::NotRetryable`] unless the node is `failed`;
    /// [`ConvoyError::WorktreeProtected`] when a clear would destroy
    /// merged-in dependency work; store and git failures propagate.
    pub fn retry_node(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        options: RetryOptions,
    ) -> Result<(), ConvoyError> {
        let handle = self.handle(plan_id)?;
        let mut plan = handle.lock_plan();
        let state = plan
            .state(node_id)
            .ok_or_else(|| ConvoyError::NodeNotFound {
                plan_id,
                node_id: node_id.clone(),
            })?;
        if state.status != NodeStatus::Failed {
            return Err(ConvoyError::NotRetryable {
                node_id: node_id.clone(),
                status: state.status,
            });
        }
        let last_failed_phase = state
            .attempt_history
            .last()
            .and_then(|a| a.failed_phase);
        let base_commit = state.base_commit;
        let worktree = state.worktree_path.clone();
        let has_session = state.agent_session_id.is_some();

        if options.clear_worktree {
            // The worktree contains true merges of the second and later
            // dependency commits; resetting to the base commit would
            // silently discard that integrated work.
            let merged_upstream = base_commit.is_some()
                && plan
                    .nodes
                    .get(node_id)
                    .is_some_and(|n| n.dependencies.len() > 1);
            if merged_upstream {
                return Err(ConvoyError::WorktreeProtected {
                    node_id: node_id.clone(),
                });
            }
        }

        // Decide the resume point.
        let resume_from = if options.clear_worktree {
            Some(Phase::Prechecks)
        } else if options.has_new_spec() {
            if options.new_prechecks.is_some() {
                Some(Phase::Prechecks)
            } else if options.new_work.is_some() {
                Some(Phase::Work)
            } else if last_failed_phase == Some(Phase::Postchecks) {
                Some(Phase::Postchecks)
            } else {
                last_failed_phase
            }
        } else {
            last_failed_phase
        };

        // Apply replacement specs to the plan and the spec store.
        let replacements = [
            (Phase::Prechecks, options.new_prechecks.clone()),
            (Phase::Work, options.new_work.clone()),
            (Phase::Postchecks, options.new_postchecks.clone()),
        ];
        for (phase, replacement) in replacements {
            if let Some(spec) = replacement {
                if let Some(node) = plan.nodes.get_mut(node_id)
                    && let crate::model::NodeKind::Job(phases) = &mut node.kind
                {
                    phases.set_slot(phase, Some(spec.clone()));
                }
                self.engine
                    .store
                    .write_node_spec(plan_id, node_id, phase, &spec)?;
            }
        }

        // Agent retry without a new spec: hand the live session a
        // synthesized follow-up instead of repeating the original task.
        if !options.has_new_spec() && has_session {
            let is_agent_work = plan
                .nodes
                .get(node_id)
                .and_then(|n| n.kind.phases())
                .and_then(|p| p.slot(Phase::Work))
                .is_some_and(PhaseSpec::is_agent);
            if is_agent_work {
                let error = plan
                    .state(node_id)
                    .and_then(|s| s.attempt_history.last())
                    .and_then(|a| a.error.clone())
                    .unwrap_or_default();
                let instructions =
                    self.synthesize_retry_instructions(plan_id, node_id, last_failed_phase, &error);
                if let Some(state) = plan.state_mut(node_id) {
                    state.retry_instructions = Some(instructions);
                }
            }
        }

        if options.clear_worktree
            && let (Some(worktree), Some(base)) = (worktree, base_commit)
        {
            drop(plan);
            let repo = {
                let plan = handle.lock_plan();
                plan.repo_path.clone()
            };
            if let Err(e) = self.engine.git.fetch(&repo, "origin") {
                warn!(error = %e, "fetch before worktree clear failed");
            }
            self.engine.git.reset_hard(&worktree, base)?;
            self.engine.git.clean_untracked(&worktree)?;
            plan = handle.lock_plan();
        }

        // Reset only this node and make it dispatchable again. The
        // attempt counter is bumped by the executor, not here.
        {
            let mut sm = PlanStateMachine::new(&mut plan);
            sm.reset_node_to_pending(node_id)?;
        }
        if let Some(state) = plan.state_mut(node_id) {
            state.resume_from_phase = resume_from;
        }
        let ready_now = plan.dependencies_met(node_id);
        if ready_now {
            let mut sm = PlanStateMachine::new(&mut plan);
            if let Ok(applied) = sm.transition(node_id, NodeStatus::Ready) {
                self.engine.emit_transitions(plan_id, &applied, Some("retry"));
            }
        }
        // Persisting after the transition means a crash here resumes at
        // ready (or pending with met deps, which the safety sweep fixes).
        self.engine.persist(&plan);
        drop(plan);

        self.engine.emit(&OrchestratorEvent::NodeRetry {
            plan_id,
            node_id: node_id.clone(),
            resume_from,
        });
        info!(node = %node_id, ?resume_from, "node queued for retry");
        Ok(())
    }

    /// Forcibly fail a scheduled or running node, killing its process
    /// tree. The node stays retryable.
    ///
    /// # Errors
    /// [`ConvoyError::NotRetryable`] when the node is not in flight.
    pub fn force_fail_node(&self, plan_id: PlanId, node_id: &NodeId) -> Result<(), ConvoyError> {
        let handle = self.handle(plan_id)?;
        handle
            .abort_flag(node_id)
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let mut plan = handle.lock_plan();
        let state = plan
            .state(node_id)
            .ok_or_else(|| ConvoyError::NodeNotFound {
                plan_id,
                node_id: node_id.clone(),
            })?;
        if !state.status.is_in_flight() {
            return Err(ConvoyError::NotRetryable {
                node_id: node_id.clone(),
                status: state.status,
            });
        }
        if let Some(pid) = state.pid {
            watchdog::kill_process_tree(pid);
        }
        if let Some(state) = plan.state_mut(node_id) {
            state.force_failed = true;
        }
        let mut sm = PlanStateMachine::new(&mut plan);
        match sm.transition(node_id, NodeStatus::Failed) {
            Ok(applied) => {
                self.engine
                    .emit_transitions(plan_id, &applied, Some("force failed"));
            }
            Err(e) => warn!(node = %node_id, error = %e, "force-fail transition rejected"),
        }
        self.engine.persist(&plan);
        drop(plan);
        self.engine.emit(&OrchestratorEvent::NodeCompleted {
            plan_id,
            node_id: node_id.clone(),
            success: false,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn handle(&self, plan_id: PlanId) -> Result<Arc<PlanHandle>, ConvoyError> {
        self.engine
            .handle(plan_id)
            .ok_or(ConvoyError::PlanNotFound { plan_id })
    }

    fn synthesize_retry_instructions(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        failed_phase: Option<Phase>,
        error: &str,
    ) -> String {
        let mut tail = String::new();
        for line in self.engine.logs.tail(plan_id, node_id, 50) {
            tail.push_str(&line);
            tail.push('\n');
        }
        if tail.len() > RETRY_LOG_BYTES {
            let cut = tail.len() - RETRY_LOG_BYTES;
            tail = tail
                .char_indices()
                .find(|(i, _)| *i >= cut)
                .map(|(i, _)| tail[i..].to_owned())
                .unwrap_or_default();
        }
        let phase = failed_phase.map_or_else(|| "work".to_owned(), |p| p.to_string());
        format!(
            "The previous attempt of this task failed during {phase}.\n\
             Failure: {error}\n\nRecent logs:\n{tail}\n\
             Continue in this same session: diagnose what went wrong, fix it, \
             and complete the original task."
        )
    }
}

impl Drop for PlanOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Engine {
    /// Forward a cancellation to the runner's optional cancel capability.
    pub(crate) fn runner_cancel_all(&self, plan_id: PlanId, handle: &Arc<PlanHandle>) {
        let nodes: Vec<NodeId> = {
            let plan = handle.lock_plan();
            plan.execution
                .iter()
                .filter(|(_, s)| s.status.is_in_flight())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for node_id in nodes {
            self.runner.cancel(plan_id, &node_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

/// Fail nodes that were in flight when the previous process died.
///
/// A `running` node whose pid is gone (or was never tracked) crashed with
/// the process; a `scheduled` node never started. Both become `failed`
/// and stay retryable.
fn recover_crashed_nodes(engine: &Arc<Engine>, plan_id: PlanId, handle: &Arc<PlanHandle>) {
    let mut plan = handle.lock_plan();
    let crashed: Vec<NodeId> = plan
        .execution
        .iter()
        .filter(|(_, s)| match s.status {
            NodeStatus::Running => s.pid.is_none_or(|pid| !watchdog::process_alive(pid)),
            NodeStatus::Scheduled => true,
            _ => false,
        })
        .map(|(id, _)| id.clone())
        .collect();
    if crashed.is_empty() {
        return;
    }

    for node_id in &crashed {
        if let Some(state) = plan.state_mut(node_id) {
            state.pid = None;
        }
        let mut sm = PlanStateMachine::new(&mut plan);
        match sm.transition(node_id, NodeStatus::Failed) {
            Ok(applied) => {
                engine.emit_transitions(plan_id, &applied, Some("crashed"));
            }
            Err(e) => warn!(node = %node_id, error = %e, "crash recovery transition failed"),
        }
    }
    engine.persist(&plan);
    drop(plan);

    for node_id in crashed {
        warn!(plan = %plan_id, node = %node_id, "node failed by crash recovery");
        engine.emit(&OrchestratorEvent::NodeCompleted {
            plan_id,
            node_id,
            success: false,
        });
    }
}
