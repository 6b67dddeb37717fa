//! Auto-heal: one-shot automatic recovery from a failed runner phase.
//!
//! Two variants:
//!
//! - A failed **non-agent** phase is swapped for a synthesized agent task
//!   that receives the original command and the tail of the phase logs,
//!   and is told to diagnose, fix in place, and re-run the original
//!   command. The stored spec is never modified; the swap lives only in
//!   the heal attempt's execution context.
//! - A failed **agent** phase is re-invoked as-is, but only when the
//!   failure looks like an external kill (signal); other agent failures
//!   are not retried automatically.

use crate::logs::LogStore;
use crate::model::plan::PhaseSpec;
use crate::model::types::{NodeId, PlanId};
use crate::model::{JobPhases, Phase};

/// Log lines embedded in synthesized heal instructions.
const HEAL_LOG_LINES: usize = 200;

/// The prepared heal attempt.
pub(crate) struct HealPlan {
    /// Phase specs for the heal attempt (the failed slot may be swapped).
    pub phases: JobPhases,
    /// The heal resumes at the failed phase; earlier phases keep their
    /// completed status.
    pub resume_from: Phase,
    /// What the heal attempt actually runs, for the attempt record.
    pub description: String,
}

/// Decide whether (and how) to auto-heal a failed phase.
///
/// Callers have already checked the node's `auto_heal` flag and the
/// one-shot-per-phase bookkeeping; this function only looks at the failed
/// spec itself.
pub(crate) fn plan_heal(
    logs: &LogStore,
    plan_id: PlanId,
    node_id: &NodeId,
    phases: &JobPhases,
    failed_phase: Phase,
    error: &str,
) -> Option<HealPlan> {
    let failed_spec = phases.slot(failed_phase)?;

    if failed_spec.is_agent() {
        // Agents are only re-run when something outside the agent killed
        // them; a failure the agent itself reported would just repeat.
        if !looks_externally_killed(error) {
            return None;
        }
        return Some(HealPlan {
            phases: phases.clone(),
            resume_from: failed_phase,
            description: format!("re-run agent after external kill: {}", failed_spec.describe()),
        });
    }

    let tail = logs.tail(plan_id, node_id, HEAL_LOG_LINES);
    let instructions = synthesize_instructions(failed_phase, failed_spec, error, &tail);
    let mut healed = phases.clone();
    healed.set_slot(
        failed_phase,
        Some(PhaseSpec::Agent { instructions }),
    );
    Some(HealPlan {
        phases: healed,
        resume_from: failed_phase,
        description: format!("synthesized agent for failed {failed_phase}"),
    })
}

/// Whether an error message looks like the process was killed from
/// outside rather than failing on its own.
fn looks_externally_killed(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("signal") || lower.contains("sigkill") || lower.contains("sigterm")
}

fn synthesize_instructions(
    phase: Phase,
    original: &PhaseSpec,
    error: &str,
    log_tail: &[String],
) -> String {
    let mut text = String::new();
    text.push_str(&format!(
        "The {phase} step of this job failed. Original step:\n\n    {}\n\nFailure: {error}\n\n",
        original.describe()
    ));
    if log_tail.is_empty() {
        text.push_str("No logs were captured for the failing step.\n\n");
    } else {
        text.push_str(&format!("Last {} log lines:\n\n", log_tail.len()));
        for line in log_tail {
            text.push_str("    ");
            text.push_str(line);
            text.push('\n');
        }
        text.push('\n');
    }
    text.push_str(
        "Diagnose the failure from the logs, fix the problem in place in this \
         working directory, then re-run the original step and make sure it passes.",
    );
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
