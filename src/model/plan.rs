//! The static plan model: job specs, phase specs, and the built DAG.
//!
//! A [`PlanSpec`] is what the user supplies — an ordered list of job specs
//! plus branch configuration. [`Plan::build`] validates it (unknown
//! dependencies, duplicates, cycles), derives internal node IDs, and
//! materializes reverse edges once so execution never walks
//! back-references.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::node_state::NodeExecutionState;
use crate::model::types::{now_ms, NodeId, PlanId, ValidationError};

// ---------------------------------------------------------------------------
// PhaseSpec
// ---------------------------------------------------------------------------

/// The specification of a single executable phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseSpec {
    /// A shell command, run through the platform shell in the worktree.
    Shell {
        /// The command line.
        command: String,
        /// Optional wall-clock timeout in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// A subprocess with an explicit program and argument vector.
    Process {
        /// The program to spawn.
        program: String,
        /// Arguments, in order.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables for the child.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        /// Optional wall-clock timeout in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// A task for an AI agent, described in natural language.
    Agent {
        /// The instructions handed to the agent.
        instructions: String,
    },
}

impl PhaseSpec {
    /// A short human label for logs and attempt records.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Shell { command, .. } => format!("shell: {command}"),
            Self::Process { program, args, .. } => {
                format!("process: {program} {}", args.join(" "))
            }
            Self::Agent { instructions } => {
                let first = instructions.lines().next().unwrap_or_default();
                format!("agent: {first}")
            }
        }
    }

    /// Returns `true` for agent-typed phases.
    #[must_use]
    pub const fn is_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// The three optional phase slots of a job node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPhases {
    /// Checks run before the work phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prechecks: Option<PhaseSpec>,
    /// The work itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<PhaseSpec>,
    /// Checks run after the work phase committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postchecks: Option<PhaseSpec>,
}

impl JobPhases {
    /// The spec in a given phase slot. `None` for phases that are not job
    /// phases (merges, commit) or for empty slots.
    #[must_use]
    pub const fn slot(&self, phase: crate::model::node_state::Phase) -> Option<&PhaseSpec> {
        use crate::model::node_state::Phase;
        match phase {
            Phase::Prechecks => self.prechecks.as_ref(),
            Phase::Work => self.work.as_ref(),
            Phase::Postchecks => self.postchecks.as_ref(),
            Phase::MergeFi | Phase::Commit | Phase::MergeRi => None,
        }
    }

    /// Replace the spec in a phase slot. Non-job phases are ignored.
    pub fn set_slot(&mut self, phase: crate::model::node_state::Phase, spec: Option<PhaseSpec>) {
        use crate::model::node_state::Phase;
        match phase {
            Phase::Prechecks => self.prechecks = spec,
            Phase::Work => self.work = spec,
            Phase::Postchecks => self.postchecks = spec,
            Phase::MergeFi | Phase::Commit | Phase::MergeRi => {}
        }
    }
}

/// What a node is: a unit of work, or a pure synchronization point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// A job with up to three phases.
    Job(JobPhases),
    /// A coordination node: no phases; it exists to join or fan out
    /// dependency edges.
    Coordination,
}

impl NodeKind {
    /// Coordination nodes are excluded from running-capacity counts.
    #[must_use]
    pub const fn is_work_performing(&self) -> bool {
        matches!(self, Self::Job(_))
    }

    /// The job phases, if this is a job node.
    #[must_use]
    pub const fn phases(&self) -> Option<&JobPhases> {
        match self {
            Self::Job(phases) => Some(phases),
            Self::Coordination => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobSpec / PlanSpec
// ---------------------------------------------------------------------------

/// One entry of the user-supplied plan: a producer ID, dependencies by
/// producer ID, the node kind, and execution flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// The user-chosen identifier, unique within the plan.
    pub id: String,

    /// Producer IDs this job depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Job phases or coordination marker.
    #[serde(flatten)]
    pub kind: NodeKind,

    /// Whether a failed non-agent phase may be retried once by a
    /// synthesized agent task (default on).
    #[serde(default = "default_true")]
    pub auto_heal: bool,

    /// Advisory: this node is expected to produce no new commit
    /// (validation-only).
    #[serde(default)]
    pub expects_no_changes: bool,
}

const fn default_true() -> bool {
    true
}

/// The static, immutable specification of a plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Human-readable plan name.
    #[serde(default)]
    pub name: String,

    /// Ordered job specs.
    pub jobs: Vec<JobSpec>,

    /// The branch (or commitish) root nodes start from.
    pub base_branch: String,

    /// The branch leaf commits are merged into. `None` disables reverse
    /// integration entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,

    /// Per-plan ceiling on concurrently running work-performing nodes.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

const fn default_max_parallel() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A built DAG vertex. Dependency and dependent edges are both cached here;
/// the dependent set is derived once at build time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Internal node identifier.
    pub id: NodeId,
    /// The producer ID the user wrote.
    pub producer_id: String,
    /// Job phases or coordination marker.
    pub kind: NodeKind,
    /// Auto-heal eligibility flag.
    pub auto_heal: bool,
    /// Advisory no-changes flag.
    pub expects_no_changes: bool,
    /// Dependencies, in the order the user listed them. The first
    /// dependency's commit becomes the worktree base.
    pub dependencies: Vec<NodeId>,
    /// Nodes that depend on this one (reverse edges, derived at build).
    pub dependents: BTreeSet<NodeId>,
}

impl Node {
    /// Coordination nodes are excluded from running-capacity counts.
    #[must_use]
    pub const fn is_work_performing(&self) -> bool {
        self.kind.is_work_performing()
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A built plan: static spec, derived DAG, and per-node execution state.
///
/// `state_version` is bumped on every mutation, by [`Plan::bump_version`]
/// or by the state machine on behalf of a node transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identity.
    pub id: PlanId,
    /// The static spec the plan was built from.
    pub spec: PlanSpec,
    /// Path to the git repository this plan operates on.
    pub repo_path: PathBuf,
    /// Producer ID → internal node ID.
    pub node_ids_by_producer: BTreeMap<String, NodeId>,
    /// All nodes, keyed by internal ID.
    pub nodes: BTreeMap<NodeId, Node>,
    /// Nodes with no dependencies.
    pub roots: BTreeSet<NodeId>,
    /// Nodes with no dependents.
    pub leaves: BTreeSet<NodeId>,
    /// Per-node execution state.
    pub execution: BTreeMap<NodeId, NodeExecutionState>,
    /// Paused flag — a paused plan is never pumped.
    pub paused: bool,
    /// Creation wall-clock time (epoch milliseconds).
    pub created_at: u64,
    /// First observed running time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Terminal wall-clock time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    /// Monotonic version stamped on every mutation.
    pub state_version: u64,
}

impl Plan {
    /// Build a plan from its spec, validating the DAG and materializing
    /// reverse edges.
    ///
    /// # Errors
    /// Returns a [`PlanBuildError`] for an empty plan, duplicate producer
    /// IDs, unknown or self dependencies, or a dependency cycle.
    pub fn build(id: PlanId, spec: PlanSpec, repo_path: PathBuf) -> Result<Self, PlanBuildError> {
        if spec.jobs.is_empty() {
            return Err(PlanBuildError::EmptyPlan);
        }
        if spec.max_parallel == 0 {
            return Err(PlanBuildError::ZeroParallelism);
        }

        // Derive internal IDs, uniquified in user order.
        let mut node_ids_by_producer: BTreeMap<String, NodeId> = BTreeMap::new();
        let mut taken: BTreeSet<NodeId> = BTreeSet::new();
        for job in &spec.jobs {
            if node_ids_by_producer.contains_key(&job.id) {
                return Err(PlanBuildError::DuplicateProducerId {
                    id: job.id.clone(),
                });
            }
            let node_id = derive_node_id(&job.id, &taken)?;
            taken.insert(node_id.clone());
            node_ids_by_producer.insert(job.id.clone(), node_id);
        }

        // Forward edges, validated against the producer map.
        let mut nodes: BTreeMap<NodeId, Node> = BTreeMap::new();
        for job in &spec.jobs {
            let node_id = node_ids_by_producer[&job.id].clone();
            let mut dependencies = Vec::with_capacity(job.depends_on.len());
            for dep in &job.depends_on {
                if dep == &job.id {
                    return Err(PlanBuildError::SelfDependency {
                        id: job.id.clone(),
                    });
                }
                let dep_id = node_ids_by_producer.get(dep).ok_or_else(|| {
                    PlanBuildError::UnknownDependency {
                        id: job.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                dependencies.push(dep_id.clone());
            }
            nodes.insert(
                node_id.clone(),
                Node {
                    id: node_id,
                    producer_id: job.id.clone(),
                    kind: job.kind.clone(),
                    auto_heal: job.auto_heal,
                    expects_no_changes: job.expects_no_changes,
                    dependencies,
                    dependents: BTreeSet::new(),
                },
            );
        }

        // Reverse edges, materialized once.
        let edges: Vec<(NodeId, NodeId)> = nodes
            .values()
            .flat_map(|n| {
                n.dependencies
                    .iter()
                    .map(|dep| (dep.clone(), n.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.insert(dependent);
            }
        }

        detect_cycle(&nodes)?;

        let roots: BTreeSet<NodeId> = nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.id.clone())
            .collect();
        let leaves: BTreeSet<NodeId> = nodes
            .values()
            .filter(|n| n.dependents.is_empty())
            .map(|n| n.id.clone())
            .collect();
        let execution: BTreeMap<NodeId, NodeExecutionState> = nodes
            .keys()
            .map(|id| (id.clone(), NodeExecutionState::default()))
            .collect();

        Ok(Self {
            id,
            spec,
            repo_path,
            node_ids_by_producer,
            nodes,
            roots,
            leaves,
            execution,
            paused: true,
            created_at: now_ms(),
            started_at: None,
            ended_at: None,
            state_version: 0,
        })
    }

    /// Bump the plan version. Node-level mutations go through the state
    /// machine, which calls this on every transition.
    pub const fn bump_version(&mut self) {
        self.state_version += 1;
    }

    /// Whether `node_id` has no dependents.
    #[must_use]
    pub fn is_leaf(&self, node_id: &NodeId) -> bool {
        self.leaves.contains(node_id)
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Look up a node's execution state.
    #[must_use]
    pub fn state(&self, node_id: &NodeId) -> Option<&NodeExecutionState> {
        self.execution.get(node_id)
    }

    /// Mutable execution state access. Callers are responsible for bumping
    /// versions; prefer going through the state machine.
    pub fn state_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeExecutionState> {
        self.execution.get_mut(node_id)
    }

    /// Resolve a producer ID to the internal node ID.
    #[must_use]
    pub fn node_id_for(&self, producer_id: &str) -> Option<&NodeId> {
        self.node_ids_by_producer.get(producer_id)
    }

    /// Whether every dependency of `node_id` has succeeded.
    #[must_use]
    pub fn dependencies_met(&self, node_id: &NodeId) -> bool {
        self.nodes.get(node_id).is_some_and(|node| {
            node.dependencies.iter().all(|dep| {
                self.execution
                    .get(dep)
                    .is_some_and(|s| s.status == crate::model::node_state::NodeStatus::Succeeded)
            })
        })
    }
}

/// Sanitize a producer ID into a valid [`NodeId`], uniquifying with a
/// numeric suffix when sanitization collides.
fn derive_node_id(producer_id: &str, taken: &BTreeSet<NodeId>) -> Result<NodeId, PlanBuildError> {
    let mut slug: String = producer_id
        .chars()
        .map(|c| {
            let lower = c.to_ascii_lowercase();
            if lower.is_ascii_lowercase() || lower.is_ascii_digit() || matches!(lower, '-' | '_' | '.')
            {
                lower
            } else {
                '-'
            }
        })
        .collect();
    slug.truncate(60);
    let slug = slug.trim_matches(['-', '.']).to_owned();
    let base = if slug.is_empty() { "node".to_owned() } else { slug };

    let candidate = NodeId::new(&base).map_err(PlanBuildError::InvalidNodeId)?;
    if !taken.contains(&candidate) {
        return Ok(candidate);
    }
    for n in 2..=taken.len() + 2 {
        let alt = NodeId::new(&format!("{base}-{n}")).map_err(PlanBuildError::InvalidNodeId)?;
        if !taken.contains(&alt) {
            return Ok(alt);
        }
    }
    // Unreachable: the loop tries more suffixes than there are taken IDs.
    Err(PlanBuildError::DuplicateProducerId {
        id: producer_id.to_owned(),
    })
}

/// Kahn's algorithm; anything left unprocessed sits on a cycle.
fn detect_cycle(nodes: &BTreeMap<NodeId, Node>) -> Result<(), PlanBuildError> {
    let mut in_degree: BTreeMap<&NodeId, usize> = nodes
        .values()
        .map(|n| (&n.id, n.dependencies.len()))
        .collect();
    let mut queue: VecDeque<&NodeId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0usize;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        if let Some(node) = nodes.get(id) {
            for dependent in &node.dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }
    if processed == nodes.len() {
        Ok(())
    } else {
        let involved: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        Err(PlanBuildError::DependencyCycle { involved })
    }
}

// ---------------------------------------------------------------------------
// PlanBuildError
// ---------------------------------------------------------------------------

/// Errors from [`Plan::build`].
#[derive(Debug)]
pub enum PlanBuildError {
    /// The plan has no jobs.
    EmptyPlan,
    /// `max_parallel` was zero, which would deadlock the plan.
    ZeroParallelism,
    /// Two job specs share a producer ID.
    DuplicateProducerId {
        /// The duplicated producer ID.
        id: String,
    },
    /// A job depends on a producer ID the plan does not define.
    UnknownDependency {
        /// The job carrying the bad edge.
        id: String,
        /// The dependency that was not found.
        dependency: String,
    },
    /// A job depends on itself.
    SelfDependency {
        /// The self-referential job.
        id: String,
    },
    /// The dependency graph contains a cycle.
    DependencyCycle {
        /// Node IDs still on the cycle after peeling.
        involved: Vec<String>,
    },
    /// A producer ID could not be turned into a valid node ID.
    InvalidNodeId(ValidationError),
}

impl fmt::Display for PlanBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPlan => {
                write!(f, "plan has no jobs.\n  To fix: add at least one job spec.")
            }
            Self::ZeroParallelism => {
                write!(
                    f,
                    "max_parallel is 0, no node could ever run.\n  To fix: set max_parallel to 1 or higher."
                )
            }
            Self::DuplicateProducerId { id } => {
                write!(
                    f,
                    "duplicate job id '{id}'.\n  To fix: give every job a unique id."
                )
            }
            Self::UnknownDependency { id, dependency } => {
                write!(
                    f,
                    "job '{id}' depends on unknown job '{dependency}'.\n  To fix: check the depends_on list for typos."
                )
            }
            Self::SelfDependency { id } => {
                write!(
                    f,
                    "job '{id}' depends on itself.\n  To fix: remove '{id}' from its own depends_on list."
                )
            }
            Self::DependencyCycle { involved } => {
                write!(
                    f,
                    "dependency cycle involving: {}.\n  To fix: break the cycle so the jobs form a DAG.",
                    involved.join(", ")
                )
            }
            Self::InvalidNodeId(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PlanBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidNodeId(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(cmd: &str) -> PhaseSpec {
        PhaseSpec::Shell {
            command: cmd.to_owned(),
            timeout_ms: None,
        }
    }

    fn job(id: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            id: id.to_owned(),
            depends_on: deps.iter().map(|s| (*s).to_owned()).collect(),
            kind: NodeKind::Job(JobPhases {
                prechecks: None,
                work: Some(shell("true")),
                postchecks: None,
            }),
            auto_heal: true,
            expects_no_changes: false,
        }
    }

    fn spec(jobs: Vec<JobSpec>) -> PlanSpec {
        PlanSpec {
            name: "test plan".to_owned(),
            jobs,
            base_branch: "main".to_owned(),
            target_branch: None,
            max_parallel: 4,
        }
    }

    fn build(jobs: Vec<JobSpec>) -> Result<Plan, PlanBuildError> {
        Plan::build(PlanId::generate(), spec(jobs), PathBuf::from("/repo"))
    }

    // -- build validation --

    #[test]
    fn empty_plan_rejected() {
        assert!(matches!(build(vec![]), Err(PlanBuildError::EmptyPlan)));
    }

    #[test]
    fn duplicate_producer_id_rejected() {
        let err = build(vec![job("a", &[]), job("a", &[])]).unwrap_err();
        assert!(matches!(err, PlanBuildError::DuplicateProducerId { .. }));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = build(vec![job("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, PlanBuildError::UnknownDependency { .. }));
    }

    #[test]
    fn self_dependency_rejected() {
        let err = build(vec![job("a", &["a"])]).unwrap_err();
        assert!(matches!(err, PlanBuildError::SelfDependency { .. }));
    }

    #[test]
    fn cycle_rejected() {
        let err = build(vec![job("a", &["b"]), job("b", &["a"])]).unwrap_err();
        assert!(matches!(err, PlanBuildError::DependencyCycle { .. }));
    }

    #[test]
    fn zero_parallelism_rejected() {
        let mut s = spec(vec![job("a", &[])]);
        s.max_parallel = 0;
        let err = Plan::build(PlanId::generate(), s, PathBuf::from("/repo")).unwrap_err();
        assert!(matches!(err, PlanBuildError::ZeroParallelism));
    }

    // -- derived structure --

    #[test]
    fn diamond_edges_and_boundaries() {
        let plan = build(vec![
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ])
        .unwrap();

        let a = plan.node_id_for("a").unwrap().clone();
        let b = plan.node_id_for("b").unwrap().clone();
        let c = plan.node_id_for("c").unwrap().clone();
        let d = plan.node_id_for("d").unwrap().clone();

        assert_eq!(plan.roots.iter().collect::<Vec<_>>(), vec![&a]);
        assert_eq!(plan.leaves.iter().collect::<Vec<_>>(), vec![&d]);
        assert_eq!(
            plan.nodes[&a].dependents,
            BTreeSet::from([b.clone(), c.clone()])
        );
        // Dependency order is preserved for the worktree base choice.
        assert_eq!(plan.nodes[&d].dependencies, vec![b, c]);
        assert!(plan.is_leaf(&d));
        assert!(!plan.is_leaf(&a));
    }

    #[test]
    fn producer_ids_are_sanitized_and_uniquified() {
        let plan = build(vec![job("Build App", &[]), job("build-app", &[])]).unwrap();
        let first = plan.node_id_for("Build App").unwrap();
        let second = plan.node_id_for("build-app").unwrap();
        assert_eq!(first.as_str(), "build-app");
        assert_eq!(second.as_str(), "build-app-2");
    }

    #[test]
    fn coordination_node_is_not_work_performing() {
        let mut jobs = vec![job("a", &[])];
        jobs.push(JobSpec {
            id: "join".to_owned(),
            depends_on: vec!["a".to_owned()],
            kind: NodeKind::Coordination,
            auto_heal: true,
            expects_no_changes: false,
        });
        let plan = build(jobs).unwrap();
        let join = plan.node_id_for("join").unwrap();
        assert!(!plan.nodes[join].is_work_performing());
    }

    #[test]
    fn new_plan_starts_paused_with_pending_nodes() {
        let plan = build(vec![job("a", &[])]).unwrap();
        assert!(plan.paused);
        assert_eq!(plan.state_version, 0);
        assert_eq!(plan.execution.len(), 1);
    }

    // -- serde --

    #[test]
    fn job_spec_kind_is_tagged() {
        let json = serde_json::to_value(&job("a", &[])).unwrap();
        assert_eq!(json["type"], "job");
        let coord = JobSpec {
            id: "j".to_owned(),
            depends_on: vec![],
            kind: NodeKind::Coordination,
            auto_heal: true,
            expects_no_changes: false,
        };
        let json = serde_json::to_value(&coord).unwrap();
        assert_eq!(json["type"], "coordination");
    }

    #[test]
    fn phase_spec_is_tagged() {
        let json = serde_json::to_value(shell("echo hi")).unwrap();
        assert_eq!(json["type"], "shell");
        let agent = PhaseSpec::Agent {
            instructions: "fix the tests".to_owned(),
        };
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["type"], "agent");
    }

    #[test]
    fn plan_roundtrips_through_json() {
        let plan = build(vec![job("a", &[]), job("b", &["a"])]).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn describe_phase_specs() {
        assert_eq!(shell("make").describe(), "shell: make");
        let agent = PhaseSpec::Agent {
            instructions: "first line\nsecond".to_owned(),
        };
        assert_eq!(agent.describe(), "agent: first line");
    }
}
