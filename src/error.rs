//! The unified error type for orchestrator operations.
//!
//! Each variant is designed to be self-contained: a caller receiving this
//! error should understand what happened and what to do next without
//! additional context.

use std::fmt;

use convoy_git::GitError;

use crate::model::types::{NodeId, PlanId};
use crate::model::{NodeStatus, PlanBuildError};
use crate::state_machine::TransitionError;
use crate::store::StoreError;

/// Unified error type for orchestrator operations.
#[derive(Debug)]
pub enum ConvoyError {
    /// The requested plan is not loaded and not on disk.
    PlanNotFound {
        /// The missing plan.
        plan_id: PlanId,
    },

    /// The requested node does not exist in the plan.
    NodeNotFound {
        /// The plan.
        plan_id: PlanId,
        /// The missing node.
        node_id: NodeId,
    },

    /// A retry was requested for a node that is not in a retryable status.
    NotRetryable {
        /// The node.
        node_id: NodeId,
        /// Its current status.
        status: NodeStatus,
    },

    /// A worktree clear was refused because downstream work already
    /// consumed this node's commit.
    WorktreeProtected {
        /// The node whose worktree was protected.
        node_id: NodeId,
    },

    /// The plan spec failed validation.
    Build(PlanBuildError),

    /// The persistent store failed.
    Store(StoreError),

    /// A git operation failed.
    Git(GitError),

    /// A state transition was rejected.
    Transition(TransitionError),
}

impl fmt::Display for ConvoyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanNotFound { plan_id } => {
                write!(
                    f,
                    "plan '{plan_id}' not found.\n  To fix: list plans to check the id."
                )
            }
            Self::NodeNotFound { plan_id, node_id } => {
                write!(
                    f,
                    "node '{node_id}' not found in plan '{plan_id}'.\n  To fix: check the node id against the plan's jobs."
                )
            }
            Self::NotRetryable { node_id, status } => {
                write!(
                    f,
                    "node '{node_id}' is {status}, only failed nodes can be retried."
                )
            }
            Self::WorktreeProtected { node_id } => {
                write!(
                    f,
                    "refusing to clear the worktree of '{node_id}': its commit was already merged downstream.\n  To fix: retry without clearing, or retry the downstream nodes first."
                )
            }
            Self::Build(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Git(e) => write!(f, "git operation failed: {e}"),
            Self::Transition(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConvoyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Build(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Git(e) => Some(e),
            Self::Transition(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlanBuildError> for ConvoyError {
    fn from(e: PlanBuildError) -> Self {
        Self::Build(e)
    }
}

impl From<StoreError> for ConvoyError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<GitError> for ConvoyError {
    fn from(e: GitError) -> Self {
        Self::Git(e)
    }
}

impl From<TransitionError> for ConvoyError {
    fn from(e: TransitionError) -> Self {
        Self::Transition(e)
    }
}
