//! The conflict resolver contract.
//!
//! When a forward or reverse merge stops on conflicts, the orchestrator
//! delegates to whichever [`ConflictResolver`] was injected. The resolver
//! works directly in the conflicted working tree (conflict markers are in
//! place, the index holds the unmerged entries) and reports success or
//! failure; the orchestrator never resolves conflicts itself.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::Metrics;

// ---------------------------------------------------------------------------
// Preference hint
// ---------------------------------------------------------------------------

/// Which side a resolver should lean toward when both are defensible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePreference {
    /// No hint; the resolver decides.
    #[default]
    None,
    /// Prefer the incoming (source) side.
    Theirs,
    /// Prefer the existing (target) side.
    Ours,
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// One conflicted merge handed to a resolver.
#[derive(Clone, Debug)]
pub struct ResolveRequest {
    /// The working tree containing the conflicted merge.
    pub cwd: PathBuf,
    /// Human-readable description of the merge source.
    pub source: String,
    /// Human-readable description of the merge target.
    pub target: String,
    /// Conflicted file paths, relative to `cwd`.
    pub conflict_files: Vec<String>,
    /// The message the resolver should commit with.
    pub commit_message: String,
    /// Side preference hint.
    pub prefer: MergePreference,
}

/// The resolver's report.
#[derive(Clone, Debug, Default)]
pub struct ResolveOutcome {
    /// Whether the conflict was resolved and committed.
    pub success: bool,
    /// Opaque session identifier, for resolvers backed by an agent.
    pub session_id: Option<String>,
    /// Resolver-reported metrics (token counts, wall time, ...).
    pub metrics: Metrics,
    /// Exit code of the resolver process, when one exists.
    pub exit_code: Option<i32>,
    /// Error description on failure.
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The conflict resolver contract.
pub trait ConflictResolver: Send + Sync {
    /// Resolve the conflicted merge described by `request`.
    ///
    /// On success the resolver has staged and committed the resolution in
    /// `request.cwd`. On failure it leaves the tree for inspection; the
    /// caller aborts the merge.
    fn resolve(&self, request: &ResolveRequest, on_output: &dyn Fn(&str)) -> ResolveOutcome;
}

/// The default resolver: declines every conflict.
///
/// Keeps merge conflicts an explicit, user-visible failure unless a real
/// resolver is configured.
pub struct UnresolvingResolver;

impl ConflictResolver for UnresolvingResolver {
    fn resolve(&self, request: &ResolveRequest, _on_output: &dyn Fn(&str)) -> ResolveOutcome {
        ResolveOutcome {
            success: false,
            error: Some(format!(
                "merge of {} into {} conflicts in {} file(s) and no conflict resolver is configured",
                request.source,
                request.target,
                request.conflict_files.len()
            )),
            ..ResolveOutcome::default()
        }
    }
}
