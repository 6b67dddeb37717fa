//! convoy-git — the git gateway for the convoy orchestrator.
//!
//! Exposes [`GitGateway`], an object-safe trait covering every git
//! operation the orchestrator performs (worktree lifecycle, merges with and
//! without checkout, ref updates, stash discipline, history inspection),
//! plus [`CliGateway`], the reference backend that shells out to `git`.

pub mod cli_impl;
pub mod error;
pub mod gateway;
pub mod types;

pub use cli_impl::CliGateway;
pub use error::GitError;
pub use gateway::GitGateway;
pub use types::{
    CommitInfo, DiffEntry, DiffStatus, GitOid, MergeOutcome, MergeTreeOutcome, OidParseError,
    WorktreeCreation,
};
