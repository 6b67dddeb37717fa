//! The convoy data model: identifiers, plan specs, the built DAG, and
//! per-node execution state.

pub mod node_state;
pub mod plan;
pub mod types;

pub use node_state::{
    AttemptOutcome, AttemptRecord, AttemptTrigger, Metrics, NodeExecutionState, NodeStatus, Phase,
    PhaseStatus,
};
pub use plan::{JobPhases, JobSpec, Node, NodeKind, PhaseSpec, Plan, PlanBuildError, PlanSpec};
pub use types::{now_ms, ErrorKind, NodeId, PlanId, ValidationError};
