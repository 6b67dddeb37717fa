//! Observable orchestrator events.
//!
//! Every externally meaningful state change is published through an
//! [`EventSink`]: UIs subscribe, tests collect, and the default sink drops
//! everything. Event delivery is synchronous and must stay cheap — sinks
//! that do real work should hand off to their own thread.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use crate::model::types::{NodeId, PlanId};
use crate::model::{NodeStatus, Phase};
use crate::state_machine::PlanStatus;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One observable orchestrator event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// A plan was created and persisted.
    PlanCreated {
        /// The plan.
        plan_id: PlanId,
    },
    /// A plan started running for the first time.
    PlanStarted {
        /// The plan.
        plan_id: PlanId,
    },
    /// A plan reached a terminal status.
    PlanCompleted {
        /// The plan.
        plan_id: PlanId,
        /// The terminal status.
        status: PlanStatus,
    },
    /// A plan was deleted (or vanished externally).
    PlanDeleted {
        /// The plan.
        plan_id: PlanId,
    },
    /// A node changed status.
    NodeTransition {
        /// The plan.
        plan_id: PlanId,
        /// The node.
        node_id: NodeId,
        /// Status before.
        from: NodeStatus,
        /// Status after.
        to: NodeStatus,
        /// Why, when the cause is not obvious from the transition itself.
        reason: Option<String>,
    },
    /// A node attempt began executing.
    NodeStarted {
        /// The plan.
        plan_id: PlanId,
        /// The node.
        node_id: NodeId,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A node finished (terminal for this dispatch, not necessarily for
    /// the node — failed nodes are retryable).
    NodeCompleted {
        /// The plan.
        plan_id: PlanId,
        /// The node.
        node_id: NodeId,
        /// Whether the node succeeded.
        success: bool,
    },
    /// A node was queued for retry.
    NodeRetry {
        /// The plan.
        plan_id: PlanId,
        /// The node.
        node_id: NodeId,
        /// The phase the next attempt resumes from.
        resume_from: Option<Phase>,
    },
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives orchestrator events.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &OrchestratorEvent);
}

/// Drops every event.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &OrchestratorEvent) {}
}

/// Forwards events into an mpsc channel. Useful in tests and simple UIs.
pub struct ChannelEventSink {
    tx: Mutex<Sender<OrchestratorEvent>>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end.
    #[must_use]
    pub fn channel() -> (Self, Receiver<OrchestratorEvent>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &OrchestratorEvent) {
        if let Ok(tx) = self.tx.lock() {
            // A dropped receiver is fine; events are best-effort.
            let _ = tx.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_events() {
        let (sink, rx) = ChannelEventSink::channel();
        let plan_id = PlanId::generate();
        sink.emit(&OrchestratorEvent::PlanCreated { plan_id });
        assert_eq!(rx.recv().unwrap(), OrchestratorEvent::PlanCreated { plan_id });
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelEventSink::channel();
        drop(rx);
        sink.emit(&OrchestratorEvent::PlanDeleted {
            plan_id: PlanId::generate(),
        });
    }
}
