//! On-disk layout of the plan store.
//!
//! ```text
//! <storage>/<planId>/plan.json
//! <storage>/<planId>/specs/<nodeId>/attempts/<N>/{work|prechecks|postchecks}.json
//! <storage>/<planId>/specs/<nodeId>/attempts/<N>/execution.log
//! <storage>/<planId>/specs/<nodeId>/current      # symlink (POSIX) / pointer file
//! <storage>/plans-index.json
//! <storage>/logs/<safePlanId>_<safeNodeId>.log   # fallback log path
//! ```
//!
//! All path construction goes through [`StorageLayout`] so nothing else in
//! the store hand-assembles paths.

use std::path::{Path, PathBuf};

use crate::model::types::{NodeId, PlanId};
use crate::model::Phase;

/// Resolves every path the store touches, relative to one storage root.
#[derive(Clone, Debug)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Wrap a storage root.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/plans-index.json`
    #[must_use]
    pub fn index_doc(&self) -> PathBuf {
        self.root.join("plans-index.json")
    }

    /// `<root>/logs`
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// `<root>/logs/<planId>_<nodeId>.log`
    ///
    /// Plan and node IDs are both filesystem-safe by construction (UUID,
    /// validated slug), so no further escaping is needed.
    #[must_use]
    pub fn fallback_log(&self, plan_id: PlanId, node_id: &NodeId) -> PathBuf {
        self.logs_dir().join(format!("{plan_id}_{node_id}.log"))
    }

    /// `<root>/<planId>`
    #[must_use]
    pub fn plan_dir(&self, plan_id: PlanId) -> PathBuf {
        self.root.join(plan_id.to_string())
    }

    /// `<root>/<planId>/plan.json`
    #[must_use]
    pub fn plan_doc(&self, plan_id: PlanId) -> PathBuf {
        self.plan_dir(plan_id).join("plan.json")
    }

    /// `<root>/<planId>/specs/<nodeId>`
    #[must_use]
    pub fn node_dir(&self, plan_id: PlanId, node_id: &NodeId) -> PathBuf {
        self.plan_dir(plan_id).join("specs").join(node_id.as_str())
    }

    /// `<root>/<planId>/specs/<nodeId>/attempts`
    #[must_use]
    pub fn attempts_dir(&self, plan_id: PlanId, node_id: &NodeId) -> PathBuf {
        self.node_dir(plan_id, node_id).join("attempts")
    }

    /// `<root>/<planId>/specs/<nodeId>/attempts/<N>`
    #[must_use]
    pub fn attempt_dir(&self, plan_id: PlanId, node_id: &NodeId, attempt: u32) -> PathBuf {
        self.attempts_dir(plan_id, node_id).join(attempt.to_string())
    }

    /// `<root>/<planId>/specs/<nodeId>/current`
    #[must_use]
    pub fn current_entry(&self, plan_id: PlanId, node_id: &NodeId) -> PathBuf {
        self.node_dir(plan_id, node_id).join("current")
    }

    /// `<root>/worktrees/<planId>`
    #[must_use]
    pub fn worktrees_dir(&self, plan_id: PlanId) -> PathBuf {
        self.root.join("worktrees").join(plan_id.to_string())
    }

    /// `<root>/worktrees/<planId>/<short8(nodeId)>`
    #[must_use]
    pub fn worktree_path(&self, plan_id: PlanId, node_id: &NodeId) -> PathBuf {
        self.worktrees_dir(plan_id).join(node_id.short())
    }

    /// The spec document filename for a phase slot (`work.json`, ...).
    /// Only job phases have spec documents.
    #[must_use]
    pub fn phase_doc_name(phase: Phase) -> Option<&'static str> {
        match phase {
            Phase::Prechecks => Some("prechecks.json"),
            Phase::Work => Some("work.json"),
            Phase::Postchecks => Some("postchecks.json"),
            Phase::MergeFi | Phase::Commit | Phase::MergeRi => None,
        }
    }

    /// The sidecar markdown filename holding agent instructions for a
    /// phase slot.
    #[must_use]
    pub fn phase_instructions_name(phase: Phase) -> Option<&'static str> {
        match phase {
            Phase::Prechecks => Some("prechecks.md"),
            Phase::Work => Some("work.md"),
            Phase::Postchecks => Some("postchecks.md"),
            Phase::MergeFi | Phase::Commit | Phase::MergeRi => None,
        }
    }

    /// The execution log filename inside an attempt directory.
    pub const EXECUTION_LOG: &'static str = "execution.log";
}
