//! End-to-end plan execution: linear chains, artifact propagation, and
//! auto-heal.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{builder, git, job, plan, rev_parse, runner_with_agent, ShellAgentStub, SCENARIO_TIMEOUT};
use convoy::model::{AttemptTrigger, JobPhases, JobSpec, NodeKind, NodeStatus, PhaseSpec};
use convoy::state_machine::PlanStatus;

/// A → B → C, each appending to a file. Every node's worktree base must be
/// its upstream's completed commit, and the plan ends succeeded with no
/// reverse integration (no target branch).
#[test]
fn linear_chain_propagates_artifacts() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let spec = plan(
        vec![
            job("a", &[], "echo a >> chain.txt"),
            job("b", &["a"], "echo b >> chain.txt"),
            job("c", &["b"], "echo c >> chain.txt"),
        ],
        None,
    );
    let plan_id = orchestrator
        .create_plan(spec, Some(repo.path().to_path_buf()))
        .unwrap();
    let base_of_main = rev_parse(repo.path(), "main");

    orchestrator.resume_plan(plan_id).unwrap();
    let status = orchestrator
        .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
        .unwrap();
    assert_eq!(status, PlanStatus::Succeeded);

    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let state = |producer: &str| {
        let id = snapshot.node_id_for(producer).unwrap();
        snapshot.state(id).unwrap().clone()
    };
    let (a, b, c) = (state("a"), state("b"), state("c"));

    assert_eq!(a.status, NodeStatus::Succeeded);
    assert_ne!(a.completed_commit.unwrap(), base_of_main);
    assert_eq!(a.base_commit.unwrap(), base_of_main);
    // Artifact propagation: each node starts from its upstream's output.
    assert_eq!(b.base_commit, a.completed_commit);
    assert_eq!(c.base_commit, b.completed_commit);
    // No reverse integration happened.
    assert!(!c.merged_to_target);
    assert_eq!(rev_parse(repo.path(), "main"), base_of_main);

    orchestrator.shutdown();
}

/// Attempt history: one attempt per node on the happy path, numbered from
/// one, with its own log slice.
#[test]
fn happy_path_attempt_history() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let plan_id = orchestrator
        .create_plan(
            plan(vec![job("only", &[], "echo done > out.txt")], None),
            Some(repo.path().to_path_buf()),
        )
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Succeeded
    );

    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let id = snapshot.node_id_for("only").unwrap();
    let state = snapshot.state(id).unwrap();
    assert_eq!(state.attempts, 1);
    assert_eq!(state.attempt_history.len(), 1);
    let attempt = &state.attempt_history[0];
    assert_eq!(attempt.number, 1);
    assert_eq!(attempt.trigger, AttemptTrigger::Initial);
    assert!(attempt.completed_commit.is_some());
    assert!(attempt.ended_at >= attempt.started_at);

    orchestrator.shutdown();
}

/// A failing work phase with auto-heal on: the failed attempt is recorded,
/// then an auto-heal attempt runs the synthesized agent. With an agent
/// that fixes the problem, the node ends succeeded.
#[test]
fn auto_heal_recovers_failed_work() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let agent = Arc::new(ShellAgentStub::new("echo healed > healed.txt"));
    let orchestrator = builder(&storage)
        .runner(runner_with_agent(Arc::clone(&agent)))
        .build()
        .unwrap();
    orchestrator.initialize().unwrap();

    let mut failing = job("flaky", &[], "exit 7");
    failing.auto_heal = true;
    let plan_id = orchestrator
        .create_plan(plan(vec![failing], None), Some(repo.path().to_path_buf()))
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Succeeded
    );

    assert_eq!(agent.launches.load(std::sync::atomic::Ordering::SeqCst), 1);
    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let id = snapshot.node_id_for("flaky").unwrap();
    let state = snapshot.state(id).unwrap();
    assert_eq!(state.status, NodeStatus::Succeeded);
    assert_eq!(state.attempt_history.len(), 2);

    let failed = &state.attempt_history[0];
    assert_eq!(failed.number, 1);
    assert_eq!(failed.exit_code, Some(7));
    assert_eq!(
        failed.failed_phase,
        Some(convoy::model::Phase::Work)
    );

    let healed = &state.attempt_history[1];
    assert_eq!(healed.number, 2);
    assert_eq!(healed.trigger, AttemptTrigger::AutoHeal);
    assert!(healed.completed_commit.is_some());

    orchestrator.shutdown();
}

/// Auto-heal with an agent that also fails: the node ends failed, with
/// both attempts on record.
#[test]
fn auto_heal_failure_fails_the_node() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let agent = Arc::new(ShellAgentStub::new("exit 1"));
    let orchestrator = builder(&storage)
        .runner(runner_with_agent(Arc::clone(&agent)))
        .build()
        .unwrap();
    orchestrator.initialize().unwrap();

    let mut failing = job("flaky", &[], "exit 7");
    failing.auto_heal = true;
    let plan_id = orchestrator
        .create_plan(plan(vec![failing], None), Some(repo.path().to_path_buf()))
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Failed
    );

    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let id = snapshot.node_id_for("flaky").unwrap();
    let state = snapshot.state(id).unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    assert_eq!(state.attempt_history.len(), 2);
    assert_eq!(state.attempt_history[1].trigger, AttemptTrigger::AutoHeal);

    orchestrator.shutdown();
}

/// Auto-heal off: a single failed attempt, no agent launch.
#[test]
fn no_auto_heal_without_the_flag() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let agent = Arc::new(ShellAgentStub::new("echo healed > healed.txt"));
    let orchestrator = builder(&storage)
        .runner(runner_with_agent(Arc::clone(&agent)))
        .build()
        .unwrap();
    orchestrator.initialize().unwrap();

    // auto_heal stays false (the helper default).
    let plan_id = orchestrator
        .create_plan(
            plan(vec![job("fails", &[], "exit 3")], None),
            Some(repo.path().to_path_buf()),
        )
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Failed
    );

    assert_eq!(agent.launches.load(std::sync::atomic::Ordering::SeqCst), 0);
    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let id = snapshot.node_id_for("fails").unwrap();
    assert_eq!(snapshot.state(id).unwrap().attempt_history.len(), 1);

    orchestrator.shutdown();
}

/// A failed node blocks its downstream dependents.
#[test]
fn failure_blocks_downstream() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let plan_id = orchestrator
        .create_plan(
            plan(
                vec![
                    job("broken", &[], "exit 1"),
                    job("after", &["broken"], "echo unreachable > x.txt"),
                ],
                None,
            ),
            Some(repo.path().to_path_buf()),
        )
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Failed
    );

    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let after = snapshot.node_id_for("after").unwrap();
    assert_eq!(snapshot.state(after).unwrap().status, NodeStatus::Blocked);

    orchestrator.shutdown();
}

/// A coordination node joins two branches of work without consuming a
/// concurrency slot, and its dependents build on the joined result.
#[test]
fn coordination_node_joins_work() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let coordination = JobSpec {
        id: "join".to_owned(),
        depends_on: vec!["left".to_owned(), "right".to_owned()],
        kind: NodeKind::Coordination,
        auto_heal: true,
        expects_no_changes: false,
    };
    let plan_id = orchestrator
        .create_plan(
            plan(
                vec![
                    job("left", &[], "echo left > left.txt"),
                    job("right", &[], "echo right > right.txt"),
                    coordination,
                    job("final", &["join"], "test -f left.txt && test -f right.txt"),
                ],
                None,
            ),
            Some(repo.path().to_path_buf()),
        )
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Succeeded
    );

    orchestrator.shutdown();
}

/// Validation-only phases that produce no commit still succeed, carrying
/// the base commit forward.
#[test]
fn no_change_node_carries_base_forward() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let mut check = job("check", &[], "test -f README.md");
    check.expects_no_changes = true;
    let plan_id = orchestrator
        .create_plan(plan(vec![check], None), Some(repo.path().to_path_buf()))
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Succeeded
    );

    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let id = snapshot.node_id_for("check").unwrap();
    let state = snapshot.state(id).unwrap();
    assert_eq!(state.completed_commit, state.base_commit);

    orchestrator.shutdown();
}

/// Prechecks gate the work phase.
#[test]
fn prechecks_gate_work() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let gated = JobSpec {
        id: "gated".to_owned(),
        depends_on: vec![],
        kind: NodeKind::Job(JobPhases {
            prechecks: Some(PhaseSpec::Shell {
                command: "false".to_owned(),
                timeout_ms: None,
            }),
            work: Some(PhaseSpec::Shell {
                command: "echo never > never.txt".to_owned(),
                timeout_ms: None,
            }),
            postchecks: None,
        }),
        auto_heal: false,
        expects_no_changes: false,
    };
    let plan_id = orchestrator
        .create_plan(plan(vec![gated], None), Some(repo.path().to_path_buf()))
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();
    assert_eq!(
        orchestrator
            .wait_for_completion(plan_id, SCENARIO_TIMEOUT)
            .unwrap(),
        PlanStatus::Failed
    );

    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    let id = snapshot.node_id_for("gated").unwrap();
    let state = snapshot.state(id).unwrap();
    assert_eq!(
        state.attempt_history[0].failed_phase,
        Some(convoy::model::Phase::Prechecks)
    );

    orchestrator.shutdown();
}

/// Canceling a running plan terminalizes every node and nothing is
/// dispatched afterwards.
#[test]
fn cancel_stops_dispatch() {
    let repo = setup();
    let storage = TempDir::new().unwrap();
    let orchestrator = builder(&storage).build().unwrap();
    orchestrator.initialize().unwrap();

    let plan_id = orchestrator
        .create_plan(
            plan(
                vec![
                    job("slow", &[], "sleep 30"),
                    job("next", &["slow"], "echo never > never.txt"),
                ],
                None,
            ),
            Some(repo.path().to_path_buf()),
        )
        .unwrap();
    orchestrator.resume_plan(plan_id).unwrap();

    // Wait until the first node is in flight.
    let slow = orchestrator
        .plan_snapshot(plan_id)
        .unwrap()
        .node_id_for("slow")
        .unwrap()
        .clone();
    let deadline = std::time::Instant::now() + SCENARIO_TIMEOUT;
    loop {
        let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
        if snapshot.state(&slow).unwrap().status.is_in_flight() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "node never dispatched");
        std::thread::sleep(std::time::Duration::from_millis(25));
    }

    orchestrator.cancel_plan(plan_id).unwrap();
    // Idempotent.
    orchestrator.cancel_plan(plan_id).unwrap();

    {
        let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
        assert!(snapshot.execution.values().all(|s| s.status.is_terminal()));
        let next = snapshot.node_id_for("next").unwrap();
        assert_eq!(snapshot.state(next).unwrap().status, NodeStatus::Canceled);
    }

    // Give the pump a few ticks: nothing may re-enter flight.
    std::thread::sleep(std::time::Duration::from_millis(300));
    let snapshot = orchestrator.plan_snapshot(plan_id).unwrap();
    assert!(snapshot.execution.values().all(|s| s.status.is_terminal()));

    orchestrator.shutdown();
}

fn setup() -> tempfile::TempDir {
    let repo = common::setup_repo();
    // Quiet detached-worktree advice noise in test output.
    git(repo.path(), &["config", "advice.detachedHead", "false"]);
    repo
}
