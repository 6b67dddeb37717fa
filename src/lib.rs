//! convoy — a plan orchestrator for DAGs of git-mutating jobs.
//!
//! A plan is a DAG of jobs over one git repository. Convoy drives each
//! job from spec to a committed artifact in an isolated worktree,
//! propagates artifacts downstream through true merges (forward
//! integration), and merges leaf commits into a target branch (reverse
//! integration). Plans survive process restarts, failed nodes are
//! retryable with attempt-by-attempt history, and failed phases can be
//! handed to an agent for one-shot auto-heal.
//!
//! The primary entry point is [`orchestrator::PlanOrchestrator`].

pub mod capacity;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod logs;
pub mod model;
pub mod orchestrator;
pub mod pump;
pub mod resolver;
pub mod ri_lock;
pub mod runner;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod watchdog;

pub use config::ConvoyConfig;
pub use error::ConvoyError;
pub use orchestrator::{OrchestratorBuilder, PlanOrchestrator, RetryOptions};
