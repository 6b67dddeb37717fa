//! Forward integration: prepare a node's worktree by merging upstream
//! dependency commits.
//!
//! The worktree is created detached at the first dependency's commit (or
//! the plan base branch for roots). Each additional dependency commit is
//! brought in with a true merge; conflicts are delegated to the resolver.
//! On success, consumption is acknowledged on every dependency so the
//! worktree sweep can reclaim upstream worktrees.

use std::path::PathBuf;

use tracing::{debug, info};

use convoy_git::GitOid;

use crate::engine::{Engine, PlanHandle};
use crate::logs::LogLevel;
use crate::model::types::NodeId;
use crate::model::{Metrics, Phase};
use crate::resolver::{ResolveOutcome, ResolveRequest};
use crate::state_machine::PlanStateMachine;

/// Gitignore entries the orchestrator maintains in target repositories.
pub(crate) const ORCHESTRATOR_IGNORE_ENTRIES: &[&str] = &[".convoy/"];

/// The prepared worktree after forward integration.
pub(crate) struct FiSuccess {
    /// The worktree base commit (first dependency or base branch).
    pub base_commit: GitOid,
    /// The worktree path.
    pub worktree: PathBuf,
    /// Worktree HEAD after all merges (differs from `base_commit` when
    /// additional dependencies were merged).
    pub head_after_merges: GitOid,
    /// Metrics gathered from the resolver, when it ran.
    pub metrics: Metrics,
}

/// Run forward integration for one node attempt.
///
/// On failure the worktree is left in place (aborted back to a clean
/// state) for retry; the error string becomes the attempt's error.
pub(crate) fn forward_integrate(
    engine: &Engine,
    handle: &PlanHandle,
    node_id: &NodeId,
    attempt: u32,
) -> Result<FiSuccess, String> {
    // Gather everything under the lock, then do git work without it.
    let (plan_id, repo, base_ref, dep_commits, preserved_base, worktree) = {
        let mut plan = handle.lock_plan();
        let sm = PlanStateMachine::new(&mut plan);
        let dep_commits = sm
            .base_commits_for(node_id)
            .map_err(|e| e.to_string())?;
        let base_ref = dep_commits.first().map_or_else(
            || plan.spec.base_branch.clone(),
            std::string::ToString::to_string,
        );
        let state = plan.state(node_id).ok_or("node state missing")?;
        (
            plan.id,
            plan.repo_path.clone(),
            base_ref,
            dep_commits,
            state.base_commit,
            engine
                .store
                .layout()
                .worktree_path(plan.id, node_id),
        )
    };

    if let Err(e) = engine
        .git
        .ensure_gitignore_entries(&repo, ORCHESTRATOR_IGNORE_ENTRIES)
    {
        debug!(error = %e, "could not maintain orchestrator gitignore entries");
    }

    let created = engine
        .git
        .create_or_reuse_detached(&repo, &worktree, &base_ref)
        .map_err(|e| format!("worktree creation failed: {e}"))?;
    // The base commit is pinned on first creation; a reused worktree's
    // HEAD reflects prior work and must not overwrite it.
    let base_commit = preserved_base.unwrap_or(created.base_commit);
    debug!(
        node = %node_id,
        worktree = %worktree.display(),
        reused = created.reused,
        base = %base_commit.short(),
        "worktree ready"
    );

    {
        let mut plan = handle.lock_plan();
        if let Some(state) = plan.state_mut(node_id) {
            state.worktree_path = Some(worktree.clone());
            if state.base_commit.is_none() {
                state.base_commit = Some(base_commit);
            }
            state.bump_version();
        }
        plan.bump_version();
        engine.persist(&plan);
    }

    // Merge the remaining dependency commits, in dependency order.
    let mut metrics = Metrics::new();
    for source in dep_commits.iter().skip(1) {
        let message = format!("{node_id}: integrate {}", source.short());
        let outcome = engine
            .git
            .merge(&worktree, *source, &message)
            .map_err(|e| format!("merge of {} failed: {e}", source.short()))?;
        if outcome.success {
            continue;
        }
        if !outcome.has_conflicts {
            return Err(format!(
                "merge of {} failed: {}",
                source.short(),
                outcome.error.unwrap_or_else(|| "unknown error".to_owned())
            ));
        }

        engine.logs.append(
            plan_id,
            node_id,
            attempt,
            Some(Phase::MergeFi),
            LogLevel::Warn,
            format!(
                "merge of {} conflicts in {} file(s), delegating to resolver",
                source.short(),
                outcome.conflict_files.len()
            ),
        );
        let request = ResolveRequest {
            cwd: worktree.clone(),
            source: format!("commit {}", source.short()),
            target: format!("worktree of {node_id}"),
            conflict_files: outcome.conflict_files.clone(),
            commit_message: message,
            prefer: engine.config.merge.prefer,
        };
        let resolved = resolve_with_logging(engine, plan_id, node_id, attempt, &request);
        if resolved.success {
            for (key, value) in &resolved.metrics {
                *metrics.entry(key.clone()).or_insert(0) += value;
            }
            info!(node = %node_id, source = %source.short(), "conflict resolved");
        } else {
            let _ = engine.git.abort_merge(&worktree);
            return Err(resolved
                .error
                .unwrap_or_else(|| "conflict resolution failed".to_owned()));
        }
    }

    let head_after_merges = engine
        .git
        .head_commit(&worktree)
        .map_err(|e| format!("could not read worktree HEAD: {e}"))?;

    acknowledge_consumption(engine, handle, node_id);

    Ok(FiSuccess {
        base_commit,
        worktree,
        head_after_merges,
        metrics,
    })
}

/// Run the resolver, funneling its output into the node's log stream.
fn resolve_with_logging(
    engine: &Engine,
    plan_id: crate::model::types::PlanId,
    node_id: &NodeId,
    attempt: u32,
    request: &ResolveRequest,
) -> ResolveOutcome {
    let on_output = |line: &str| {
        engine.logs.append(
            plan_id,
            node_id,
            attempt,
            Some(Phase::MergeFi),
            LogLevel::Info,
            line,
        );
    };
    engine.resolver.resolve(request, &on_output)
}

/// Record this node as a consumer on every dependency, then run the
/// worktree sweep.
fn acknowledge_consumption(engine: &Engine, handle: &PlanHandle, node_id: &NodeId) {
    {
        let mut plan = handle.lock_plan();
        let deps: Vec<NodeId> = plan
            .nodes
            .get(node_id)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default();
        for dep in deps {
            if let Some(state) = plan.state_mut(&dep) {
                state.consumed_by_dependents.insert(node_id.clone());
                state.bump_version();
            }
        }
        plan.bump_version();
        engine.persist(&plan);
    }
    super::sweep_worktrees(engine, handle);
}
