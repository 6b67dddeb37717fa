//! The node executor: drives one node end-to-end.
//!
//! Dispatch order for a job node:
//!
//! ```text
//! snapshot logs → running → forward integration → runner phases
//!   → (auto-heal once on phase failure) → commit carry-forward
//!   → reverse integration (leaves) → succeeded
//! ```
//!
//! Every terminal path appends an [`AttemptRecord`] holding exactly the
//! logs this attempt produced. Cancellation is cooperative: the abort flag
//! is checked at every step boundary, and the runner checks it while
//! waiting on processes.

pub mod forward;
pub mod heal;
pub mod reverse;
pub mod summary;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use convoy_git::GitOid;

use crate::engine::{Engine, PlanHandle};
use crate::events::OrchestratorEvent;
use crate::logs::{LogCursor, LogLevel};
use crate::model::types::{now_ms, NodeId, PlanId};
use crate::model::{
    AttemptOutcome, AttemptRecord, AttemptTrigger, JobPhases, Metrics, NodeKind, NodeStatus, Phase,
    PhaseSpec, PhaseStatus,
};
use crate::runner::{ExecutionContext, ExecutionResult, RunnerEvents};
use crate::state_machine::PlanStateMachine;

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

/// Everything captured when an attempt begins.
struct AttemptSetup {
    plan_id: PlanId,
    repo: PathBuf,
    attempt: u32,
    trigger: AttemptTrigger,
    started_at: u64,
    cursor: LogCursor,
    resume_from: Option<Phase>,
    agent_session: Option<String>,
    retry_instructions: Option<String>,
    previous_statuses: BTreeMap<Phase, PhaseStatus>,
    kind: NodeKind,
    auto_heal: bool,
    expects_no_changes: bool,
    is_leaf: bool,
    target_branch: Option<String>,
    dep_count: usize,
}

/// Mutable facts accumulated while the attempt runs, folded into the
/// attempt record at the end.
#[derive(Default)]
struct AttemptFacts {
    base_commit: Option<GitOid>,
    completed_commit: Option<GitOid>,
    worktree: Option<PathBuf>,
    work_used: Option<String>,
    metrics: Metrics,
    advisory: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Execute one dispatched node. Called on a dedicated thread per node;
/// never panics the process on execution failure.
pub(crate) fn execute_node(engine: &Arc<Engine>, handle: &Arc<PlanHandle>, node_id: &NodeId) {
    let abort = handle.abort_flag(node_id);
    run_node(engine, handle, node_id, &abort);
    handle.clear_abort(node_id);
}

#[allow(clippy::too_many_lines)]
fn run_node(
    engine: &Arc<Engine>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    abort: &Arc<AtomicBool>,
) {
    // -- (a) begin the attempt -------------------------------------------
    let Some(setup) = begin_attempt(engine, handle, node_id) else {
        return;
    };
    let mut facts = AttemptFacts::default();

    if let Err(e) = engine
        .store
        .snapshot_specs_for_attempt(setup.plan_id, node_id, setup.attempt)
    {
        fail_attempt(engine, handle, node_id, &setup, &facts, None, None, e.to_string());
        return;
    }

    if abort.load(Ordering::SeqCst) {
        cancel_attempt(engine, handle, node_id, &setup, &facts);
        return;
    }

    // -- coordination shortcut -------------------------------------------
    // A join point with at most one upstream commit needs no worktree:
    // its output is the upstream commit (or the plan base).
    if matches!(setup.kind, NodeKind::Coordination) && setup.dep_count <= 1 {
        match coordination_commit(engine, handle, node_id, &setup) {
            Ok(commit) => {
                facts.completed_commit = Some(commit);
                facts.base_commit = Some(commit);
            }
            Err(e) => {
                fail_attempt(
                    engine,
                    handle,
                    node_id,
                    &setup,
                    &facts,
                    Some(Phase::MergeFi),
                    None,
                    e,
                );
                return;
            }
        }
        finish_ri_and_success(engine, handle, node_id, &setup, facts, abort);
        return;
    }

    // -- (b) forward integration -----------------------------------------
    let fi = match forward::forward_integrate(engine, handle, node_id, setup.attempt) {
        Ok(fi) => fi,
        Err(error) => {
            fail_attempt(
                engine,
                handle,
                node_id,
                &setup,
                &facts,
                Some(Phase::MergeFi),
                None,
                error,
            );
            return;
        }
    };
    facts.base_commit = Some(fi.base_commit);
    facts.worktree = Some(fi.worktree.clone());
    facts.metrics = fi.metrics;
    set_phase_status(engine, handle, node_id, Phase::MergeFi, PhaseStatus::Success);

    if abort.load(Ordering::SeqCst) {
        cancel_attempt(engine, handle, node_id, &setup, &facts);
        return;
    }

    // -- multi-dependency coordination: the merged tree is the output ----
    if matches!(setup.kind, NodeKind::Coordination) {
        facts.completed_commit = Some(fi.head_after_merges);
        finish_ri_and_success(engine, handle, node_id, &setup, facts, abort);
        return;
    }

    // -- (c) runner phases ------------------------------------------------
    let NodeKind::Job(mut phases) = setup.kind.clone() else {
        // Unreachable: coordination handled above.
        return;
    };
    // A retry of an agent work phase with a live session gets synthesized
    // follow-up instructions instead of the original task text.
    if let Some(instructions) = setup.retry_instructions.clone()
        && phases.slot(Phase::Work).is_some_and(PhaseSpec::is_agent)
    {
        phases.set_slot(Phase::Work, Some(PhaseSpec::Agent { instructions }));
    }
    facts.work_used = phases.slot(Phase::Work).map(PhaseSpec::describe);

    let events: Arc<dyn RunnerEvents> = Arc::new(ExecutorEvents {
        engine: Arc::clone(engine),
        handle: Arc::clone(handle),
        plan_id: setup.plan_id,
        node_id: node_id.clone(),
        attempt: setup.attempt,
    });
    let ctx = ExecutionContext {
        plan_id: setup.plan_id,
        node_id: node_id.clone(),
        base_commit: fi.base_commit,
        worktree_path: fi.worktree.clone(),
        attempt: setup.attempt,
        resume_from_phase: setup.resume_from,
        previous_phase_statuses: setup.previous_statuses.clone(),
        agent_session_id: setup.agent_session.clone(),
        phases: phases.clone(),
        aborted: Arc::clone(abort),
        events: Arc::clone(&events),
    };
    let mut result = engine.runner.execute(&ctx);
    let mut setup = setup;

    if result.canceled {
        cancel_attempt(engine, handle, node_id, &setup, &facts);
        return;
    }

    // -- (d) auto-heal -----------------------------------------------------
    if !result.success {
        let healed = try_auto_heal(
            engine, handle, node_id, &mut setup, &mut facts, &phases, &ctx, &result, abort,
        );
        match healed {
            HealOutcome::NotEligible => {
                absorb_result(engine, handle, node_id, &mut facts, &result);
                fail_attempt(
                    engine,
                    handle,
                    node_id,
                    &setup,
                    &facts,
                    result.failed_phase,
                    result.exit_code,
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| "phase failed".to_owned()),
                );
                return;
            }
            HealOutcome::Canceled => {
                cancel_attempt(engine, handle, node_id, &setup, &facts);
                return;
            }
            HealOutcome::Ran(heal_result) => {
                result = heal_result;
                if !result.success {
                    absorb_result(engine, handle, node_id, &mut facts, &result);
                    fail_attempt(
                        engine,
                        handle,
                        node_id,
                        &setup,
                        &facts,
                        result.failed_phase,
                        result.exit_code,
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| "auto-heal attempt failed".to_owned()),
                    );
                    return;
                }
            }
        }
    }

    // -- (e) commit carry-forward ----------------------------------------
    absorb_result(engine, handle, node_id, &mut facts, &result);
    let completed = result.completed_commit.unwrap_or(fi.base_commit);
    facts.completed_commit = Some(completed);
    if setup.expects_no_changes && completed != fi.base_commit {
        engine.logs.append(
            setup.plan_id,
            node_id,
            setup.attempt,
            Some(Phase::Commit),
            LogLevel::Warn,
            "node was expected to produce no changes but committed work",
        );
    }

    // -- (f)(g)(h) reverse integration, success, cleanup ------------------
    finish_ri_and_success(engine, handle, node_id, &setup, facts, abort);
}

// ---------------------------------------------------------------------------
// Attempt lifecycle steps
// ---------------------------------------------------------------------------

/// Transition to running, stamp the attempt counter, and capture the log
/// cursor. Returns `None` when the node is no longer scheduled (raced
/// with a cancel).
fn begin_attempt(
    engine: &Engine,
    handle: &PlanHandle,
    node_id: &NodeId,
) -> Option<AttemptSetup> {
    let mut plan = handle.lock_plan();
    let plan_id = plan.id;
    let cursor = engine.logs.cursor(plan_id, node_id);

    if plan.state(node_id).map(|s| s.status) != Some(NodeStatus::Running) {
        // The pump transitions ready → scheduled; the executor owns
        // scheduled → running.
        let mut sm = PlanStateMachine::new(&mut plan);
        match sm.transition(node_id, NodeStatus::Running) {
            Ok(applied) => engine.emit_transitions(plan_id, &applied, None),
            Err(e) => {
                warn!(node = %node_id, error = %e, "node no longer dispatchable");
                return None;
            }
        }
    }

    let node = plan.nodes.get(node_id)?.clone();
    let is_leaf = plan.is_leaf(node_id);
    let target_branch = plan.spec.target_branch.clone();
    let repo = plan.repo_path.clone();

    let state = plan.state_mut(node_id)?;
    state.attempts += 1;
    let attempt = state.attempts;
    let trigger = if attempt == 1 {
        AttemptTrigger::Initial
    } else {
        AttemptTrigger::Retry
    };
    let resume_from = state.resume_from_phase.take();
    let agent_session = state.agent_session_id.clone();
    let retry_instructions = state.retry_instructions.take();
    // Earlier phase outcomes inform resume decisions; the live map then
    // restarts clean for this attempt.
    let previous_statuses = std::mem::take(&mut state.phase_statuses);
    state.bump_version();
    plan.bump_version();
    engine.persist(&plan);
    drop(plan);

    engine.emit(&OrchestratorEvent::NodeStarted {
        plan_id,
        node_id: node_id.clone(),
        attempt,
    });
    info!(node = %node_id, attempt, "node attempt started");

    Some(AttemptSetup {
        plan_id,
        repo,
        attempt,
        trigger,
        started_at: now_ms(),
        cursor,
        resume_from,
        agent_session,
        retry_instructions,
        previous_statuses,
        kind: node.kind,
        auto_heal: node.auto_heal,
        expects_no_changes: node.expects_no_changes,
        is_leaf,
        target_branch,
        dep_count: node.dependencies.len(),
    })
}

/// The completed commit of a trivial coordination node.
fn coordination_commit(
    engine: &Engine,
    handle: &PlanHandle,
    node_id: &NodeId,
    setup: &AttemptSetup,
) -> Result<GitOid, String> {
    let (upstream, base_branch) = {
        let mut plan = handle.lock_plan();
        let base_branch = plan.spec.base_branch.clone();
        let sm = PlanStateMachine::new(&mut plan);
        let upstream = sm
            .base_commits_for(node_id)
            .map_err(|e| e.to_string())?
            .first()
            .copied();
        (upstream, base_branch)
    };
    match upstream {
        Some(commit) => Ok(commit),
        None => engine
            .git
            .resolve_ref(&setup.repo, &base_branch)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("base branch '{base_branch}' does not resolve")),
    }
}

enum HealOutcome {
    NotEligible,
    Canceled,
    Ran(ExecutionResult),
}

/// Run the one-shot auto-heal attempt when the failure is eligible.
#[allow(clippy::too_many_arguments)]
fn try_auto_heal(
    engine: &Arc<Engine>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    setup: &mut AttemptSetup,
    facts: &mut AttemptFacts,
    phases: &JobPhases,
    ctx: &ExecutionContext,
    failed: &ExecutionResult,
    abort: &Arc<AtomicBool>,
) -> HealOutcome {
    let Some(failed_phase) = failed.failed_phase else {
        return HealOutcome::NotEligible;
    };
    if !setup.auto_heal || !failed_phase.is_runner_phase() {
        return HealOutcome::NotEligible;
    }
    {
        let plan = handle.lock_plan();
        let already = plan
            .state(node_id)
            .is_some_and(|s| s.auto_heal_attempted.contains(&failed_phase));
        if already {
            return HealOutcome::NotEligible;
        }
    }
    let error = failed.error.clone().unwrap_or_default();
    let Some(heal) = heal::plan_heal(&engine.logs, setup.plan_id, node_id, phases, failed_phase, &error)
    else {
        return HealOutcome::NotEligible;
    };

    // The failed attempt is closed out before the heal attempt opens.
    record_attempt(
        engine,
        handle,
        node_id,
        setup,
        facts,
        AttemptOutcome::Failed,
        failed.failed_phase,
        failed.error.clone(),
        failed.exit_code,
    );

    let heal_attempt = {
        let mut plan = handle.lock_plan();
        let Some(state) = plan.state_mut(node_id) else {
            return HealOutcome::NotEligible;
        };
        state.auto_heal_attempted.insert(failed_phase);
        state.attempts += 1;
        let heal_attempt = state.attempts;
        state.bump_version();
        plan.bump_version();
        engine.persist(&plan);
        heal_attempt
    };
    if let Err(e) = engine
        .store
        .snapshot_specs_for_attempt(setup.plan_id, node_id, heal_attempt)
    {
        warn!(node = %node_id, error = %e, "could not snapshot specs for heal attempt");
    }

    info!(node = %node_id, phase = %failed_phase, "auto-heal attempt starting");
    engine.logs.append(
        setup.plan_id,
        node_id,
        heal_attempt,
        Some(failed_phase),
        LogLevel::Warn,
        format!("auto-heal: {}", heal.description),
    );

    // Re-point the attempt bookkeeping at the heal attempt.
    setup.attempt = heal_attempt;
    setup.trigger = AttemptTrigger::AutoHeal;
    setup.started_at = now_ms();
    setup.cursor = engine.logs.cursor(setup.plan_id, node_id);
    facts.work_used = Some(heal.description.clone());
    facts.metrics = Metrics::new();

    if abort.load(Ordering::SeqCst) {
        return HealOutcome::Canceled;
    }

    let heal_events: Arc<dyn RunnerEvents> = Arc::new(ExecutorEvents {
        engine: Arc::clone(engine),
        handle: Arc::clone(handle),
        plan_id: setup.plan_id,
        node_id: node_id.clone(),
        attempt: heal_attempt,
    });
    let heal_ctx = ExecutionContext {
        plan_id: ctx.plan_id,
        node_id: ctx.node_id.clone(),
        base_commit: ctx.base_commit,
        worktree_path: ctx.worktree_path.clone(),
        attempt: heal_attempt,
        resume_from_phase: Some(heal.resume_from),
        previous_phase_statuses: previous_statuses(handle, node_id),
        agent_session_id: ctx.agent_session_id.clone(),
        phases: heal.phases,
        aborted: Arc::clone(abort),
        events: heal_events,
    };
    let result = engine.runner.execute(&heal_ctx);
    if result.canceled {
        return HealOutcome::Canceled;
    }
    HealOutcome::Ran(result)
}

/// Reverse integration (for leaves) followed by the success bookkeeping.
fn finish_ri_and_success(
    engine: &Arc<Engine>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    setup: &AttemptSetup,
    mut facts: AttemptFacts,
    abort: &Arc<AtomicBool>,
) {
    // The completed commit is durable from here on: even if reverse
    // integration fails, the work is preserved for a merge-only retry.
    if facts.completed_commit.is_some() {
        let mut plan = handle.lock_plan();
        if let Some(state) = plan.state_mut(node_id) {
            state.completed_commit = facts.completed_commit;
            state.bump_version();
        }
        plan.bump_version();
        engine.persist(&plan);
    }

    let needs_ri = setup.is_leaf && setup.target_branch.is_some();
    if needs_ri && abort.load(Ordering::SeqCst) {
        cancel_attempt(engine, handle, node_id, setup, &facts);
        return;
    }
    if needs_ri {
        let target = setup.target_branch.clone().unwrap_or_default();
        let Some(completed) = facts.completed_commit else {
            fail_attempt(
                engine,
                handle,
                node_id,
                setup,
                &facts,
                Some(Phase::MergeRi),
                None,
                "no completed commit to merge".to_owned(),
            );
            return;
        };
        let outcome = {
            let _slot = engine.ri_lock.acquire();
            reverse::reverse_integrate(
                engine,
                setup.plan_id,
                node_id,
                setup.attempt,
                &setup.repo,
                &target,
                completed,
            )
        };
        match outcome {
            reverse::RiResult::Merged { advisory, metrics } => {
                for (key, value) in &metrics {
                    *facts.metrics.entry(key.clone()).or_insert(0) += value;
                }
                if let Some(advisory) = &advisory {
                    warn!(node = %node_id, advisory = %advisory, "merge completed with advisory");
                }
                facts.advisory = advisory;
                set_phase_status(engine, handle, node_id, Phase::MergeRi, PhaseStatus::Success);
                let mut plan = handle.lock_plan();
                if let Some(state) = plan.state_mut(node_id) {
                    state.merged_to_target = true;
                    state.bump_version();
                }
                plan.bump_version();
                engine.persist(&plan);
            }
            reverse::RiResult::Failed { error } => {
                set_phase_status(engine, handle, node_id, Phase::MergeRi, PhaseStatus::Failed);
                fail_attempt(
                    engine,
                    handle,
                    node_id,
                    setup,
                    &facts,
                    Some(Phase::MergeRi),
                    None,
                    error,
                );
                return;
            }
        }
    }

    succeed_attempt(engine, handle, node_id, setup, facts);
}

/// Record the successful attempt, transition, summarize, and clean up.
fn succeed_attempt(
    engine: &Arc<Engine>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    setup: &AttemptSetup,
    facts: AttemptFacts,
) {
    record_attempt(
        engine,
        handle,
        node_id,
        setup,
        &facts,
        AttemptOutcome::Succeeded,
        None,
        None,
        None,
    );

    {
        let mut plan = handle.lock_plan();
        if let Some(state) = plan.state_mut(node_id) {
            state.completed_commit = facts.completed_commit;
            state.bump_version();
        }
        let mut sm = PlanStateMachine::new(&mut plan);
        match sm.transition(node_id, NodeStatus::Succeeded) {
            Ok(applied) => engine.emit_transitions(setup.plan_id, &applied, None),
            Err(e) => warn!(node = %node_id, error = %e, "could not mark node succeeded"),
        }
        engine.persist(&plan);
    }
    engine.emit(&OrchestratorEvent::NodeCompleted {
        plan_id: setup.plan_id,
        node_id: node_id.clone(),
        success: true,
    });

    // Work summaries: the node's own commits, and for leaves the full
    // range being merged to the target.
    if let (Some(base), Some(completed)) = (facts.base_commit, facts.completed_commit) {
        match summary::compute_work_summary(engine.git.as_ref(), &setup.repo, base, completed) {
            Ok(work) => info!(node = %node_id, %work, "node work summary"),
            Err(e) => warn!(node = %node_id, error = %e, "could not summarize work"),
        }
        if setup.is_leaf {
            let plan_base = {
                let plan = handle.lock_plan();
                let base_branch = plan.spec.base_branch.clone();
                drop(plan);
                engine.git.resolve_ref(&setup.repo, &base_branch).ok().flatten()
            };
            if let Some(plan_base) = plan_base
                && let Ok(aggregated) = summary::compute_work_summary(
                    engine.git.as_ref(),
                    &setup.repo,
                    plan_base,
                    completed,
                )
            {
                info!(node = %node_id, %aggregated, "aggregated summary to target");
            }
        }
    }

    sweep_worktrees(engine, handle);
    info!(node = %node_id, attempt = setup.attempt, "node succeeded");
}

/// Record a failed attempt and transition the node to failed.
#[allow(clippy::too_many_arguments)]
fn fail_attempt(
    engine: &Arc<Engine>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    setup: &AttemptSetup,
    facts: &AttemptFacts,
    failed_phase: Option<Phase>,
    exit_code: Option<i32>,
    error: String,
) {
    engine.logs.append(
        setup.plan_id,
        node_id,
        setup.attempt,
        failed_phase,
        LogLevel::Error,
        error.clone(),
    );
    record_attempt(
        engine,
        handle,
        node_id,
        setup,
        facts,
        AttemptOutcome::Failed,
        failed_phase,
        Some(error.clone()),
        exit_code,
    );
    {
        let mut plan = handle.lock_plan();
        let mut sm = PlanStateMachine::new(&mut plan);
        match sm.transition(node_id, NodeStatus::Failed) {
            Ok(applied) => engine.emit_transitions(setup.plan_id, &applied, Some(&error)),
            Err(e) => warn!(node = %node_id, error = %e, "could not mark node failed"),
        }
        engine.persist(&plan);
    }
    engine.emit(&OrchestratorEvent::NodeCompleted {
        plan_id: setup.plan_id,
        node_id: node_id.clone(),
        success: false,
    });
    warn!(node = %node_id, attempt = setup.attempt, error = %error, "node attempt failed");
}

/// Record a canceled attempt and transition the node to canceled.
fn cancel_attempt(
    engine: &Arc<Engine>,
    handle: &Arc<PlanHandle>,
    node_id: &NodeId,
    setup: &AttemptSetup,
    facts: &AttemptFacts,
) {
    record_attempt(
        engine,
        handle,
        node_id,
        setup,
        facts,
        AttemptOutcome::Canceled,
        None,
        None,
        None,
    );
    let mut plan = handle.lock_plan();
    let mut sm = PlanStateMachine::new(&mut plan);
    match sm.transition(node_id, NodeStatus::Canceled) {
        Ok(applied) => engine.emit_transitions(setup.plan_id, &applied, Some("canceled")),
        Err(e) => warn!(node = %node_id, error = %e, "could not mark node canceled"),
    }
    engine.persist(&plan);
    info!(node = %node_id, "node attempt canceled");
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Append the attempt record for the attempt described by `setup`/`facts`.
#[allow(clippy::too_many_arguments)]
fn record_attempt(
    engine: &Engine,
    handle: &PlanHandle,
    node_id: &NodeId,
    setup: &AttemptSetup,
    facts: &AttemptFacts,
    outcome: AttemptOutcome,
    failed_phase: Option<Phase>,
    error: Option<String>,
    exit_code: Option<i32>,
) {
    let log_slice = engine
        .logs
        .slice_since(setup.plan_id, node_id, setup.cursor);
    let record = AttemptRecord {
        number: setup.attempt,
        trigger: setup.trigger,
        started_at: setup.started_at,
        ended_at: now_ms(),
        outcome,
        failed_phase,
        error,
        advisory: facts.advisory.clone(),
        exit_code,
        work_used: facts.work_used.clone(),
        log_slice,
        worktree_path: facts.worktree.clone(),
        base_commit: facts.base_commit,
        completed_commit: facts.completed_commit,
        metrics: facts.metrics.clone(),
    };
    let mut plan = handle.lock_plan();
    if let Some(state) = plan.state_mut(node_id) {
        state.record_attempt(record);
    }
    plan.bump_version();
    engine.persist(&plan);
}

/// Fold a runner result into the attempt facts and node state.
fn absorb_result(
    engine: &Engine,
    handle: &PlanHandle,
    node_id: &NodeId,
    facts: &mut AttemptFacts,
    result: &ExecutionResult,
) {
    for (key, value) in &result.metrics {
        *facts.metrics.entry(key.clone()).or_insert(0) += value;
    }
    if result.completed_commit.is_some() {
        facts.completed_commit = result.completed_commit;
    }
    let mut plan = handle.lock_plan();
    if let Some(state) = plan.state_mut(node_id) {
        if let Some(session) = &result.agent_session_id {
            state.agent_session_id = Some(session.clone());
        }
        state.bump_version();
    }
    plan.bump_version();
    engine.persist(&plan);
}

fn previous_statuses(handle: &PlanHandle, node_id: &NodeId) -> BTreeMap<Phase, PhaseStatus> {
    let plan = handle.lock_plan();
    plan.state(node_id)
        .map(|s| s.phase_statuses.clone())
        .unwrap_or_default()
}

fn set_phase_status(
    engine: &Engine,
    handle: &PlanHandle,
    node_id: &NodeId,
    phase: Phase,
    status: PhaseStatus,
) {
    let mut plan = handle.lock_plan();
    if let Some(state) = plan.state_mut(node_id) {
        state.phase_statuses.insert(phase, status);
        state.bump_version();
    }
    plan.bump_version();
    engine.persist(&plan);
}

/// Remove worktrees whose output has been fully consumed.
///
/// A non-leaf worktree is removable once every dependent has acknowledged
/// forward integration; a leaf's once its commit is on the target branch
/// (or the plan has no target).
pub(crate) fn sweep_worktrees(engine: &Engine, handle: &PlanHandle) {
    if !engine.config.clean_up_successful_work {
        return;
    }
    let (repo, removable) = {
        let plan = handle.lock_plan();
        let has_target = plan.spec.target_branch.is_some();
        let removable: Vec<(NodeId, PathBuf)> = plan
            .execution
            .iter()
            .filter_map(|(id, state)| {
                if state.status != NodeStatus::Succeeded {
                    return None;
                }
                let worktree = state.worktree_path.clone()?;
                let node = plan.nodes.get(id)?;
                let consumed = if plan.is_leaf(id) {
                    state.merged_to_target || !has_target
                } else {
                    node.dependents
                        .iter()
                        .all(|d| state.consumed_by_dependents.contains(d))
                };
                consumed.then(|| (id.clone(), worktree))
            })
            .collect();
        (plan.repo_path.clone(), removable)
    };

    for (node_id, worktree) in removable {
        match engine.git.remove_worktree_safe(&repo, &worktree) {
            Ok(()) => {
                info!(node = %node_id, worktree = %worktree.display(), "worktree reclaimed");
                let mut plan = handle.lock_plan();
                if let Some(state) = plan.state_mut(&node_id) {
                    state.worktree_path = None;
                    state.bump_version();
                }
                plan.bump_version();
                engine.persist(&plan);
            }
            Err(e) => warn!(node = %node_id, error = %e, "could not remove worktree"),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner event bridge
// ---------------------------------------------------------------------------

/// Routes runner callbacks into logs and node state.
struct ExecutorEvents {
    engine: Arc<Engine>,
    handle: Arc<PlanHandle>,
    plan_id: PlanId,
    node_id: NodeId,
    attempt: u32,
}

impl RunnerEvents for ExecutorEvents {
    fn on_log(&self, phase: Phase, level: LogLevel, message: &str) {
        self.engine
            .logs
            .append(self.plan_id, &self.node_id, self.attempt, Some(phase), level, message);
    }

    fn on_phase_status(&self, phase: Phase, status: PhaseStatus) {
        set_phase_status(&self.engine, &self.handle, &self.node_id, phase, status);
    }

    fn on_pid(&self, pid: Option<u32>) {
        let mut plan = self.handle.lock_plan();
        if let Some(state) = plan.state_mut(&self.node_id) {
            state.pid = pid;
            state.bump_version();
        }
        plan.bump_version();
        self.engine.persist(&plan);
    }
}
