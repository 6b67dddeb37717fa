//! Append-only execution logs with per-attempt isolation.
//!
//! Every log line is held in memory (for fast slicing into attempt
//! records) and appended to disk: the current attempt's `execution.log`
//! when the attempt directory exists, the plan/node fallback file
//! otherwise. Offsets captured at attempt start guarantee each attempt
//! record receives exactly the lines produced during that attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::types::{now_ms, NodeId, PlanId};
use crate::model::Phase;
use crate::store::PlanStore;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Severity of a log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Routine progress.
    Info,
    /// Something notable but non-fatal.
    Warn,
    /// A failure.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Wall-clock time (epoch milliseconds).
    pub at: u64,
    /// Attempt the line belongs to.
    pub attempt: u32,
    /// Phase that produced the line, when known.
    pub phase: Option<Phase>,
    /// Severity.
    pub level: LogLevel,
    /// The message.
    pub message: String,
}

impl LogEntry {
    /// Render the line the way it is written to disk.
    #[must_use]
    pub fn render(&self) -> String {
        let phase = self.phase.map_or_else(|| "-".to_owned(), |p| p.to_string());
        format!(
            "[{}] [attempt {}] [{}] [{}] {}",
            self.at, self.attempt, phase, self.level, self.message
        )
    }
}

/// A position in a node's log stream, captured before an attempt starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogCursor {
    /// Index into the in-memory entry vector.
    pub memory_index: usize,
    /// Byte size of the fallback log file at capture time.
    pub file_offset: u64,
}

// ---------------------------------------------------------------------------
// LogStore
// ---------------------------------------------------------------------------

type NodeKey = (PlanId, NodeId);

/// In-memory log registry plus disk append.
pub struct LogStore {
    store: PlanStore,
    entries: Mutex<BTreeMap<NodeKey, Vec<LogEntry>>>,
}

impl LogStore {
    /// Create a log store writing through the given plan store's layout.
    #[must_use]
    pub fn new(store: PlanStore) -> Self {
        Self {
            store,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Append one line: in memory and to the attempt's execution log (or
    /// the fallback file when no attempt directory exists yet). Disk
    /// failures are reported at debug level and never fail the caller —
    /// logging must not take down an execution.
    pub fn append(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        attempt: u32,
        phase: Option<Phase>,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        let entry = LogEntry {
            at: now_ms(),
            attempt,
            phase,
            level,
            message: message.into(),
        };
        let line = entry.render();

        let mut map = self.lock();
        map.entry((plan_id, node_id.clone()))
            .or_default()
            .push(entry);
        drop(map);

        let path = self
            .store
            .resolve_current(plan_id, node_id)
            .map_or_else(
                || self.store.layout().fallback_log(plan_id, node_id),
                |dir| dir.join(crate::store::StorageLayout::EXECUTION_LOG),
            );
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = appended {
            debug!(path = %path.display(), error = %e, "log append failed");
        }
    }

    /// Capture the offsets that delimit the next attempt's log slice.
    #[must_use]
    pub fn cursor(&self, plan_id: PlanId, node_id: &NodeId) -> LogCursor {
        let map = self.lock();
        let memory_index = map
            .get(&(plan_id, node_id.clone()))
            .map_or(0, Vec::len);
        drop(map);
        let file_offset = std::fs::metadata(self.store.layout().fallback_log(plan_id, node_id))
            .map_or(0, |m| m.len());
        LogCursor {
            memory_index,
            file_offset,
        }
    }

    /// The rendered lines appended since `cursor`.
    #[must_use]
    pub fn slice_since(&self, plan_id: PlanId, node_id: &NodeId, cursor: LogCursor) -> Vec<String> {
        let map = self.lock();
        map.get(&(plan_id, node_id.clone()))
            .map(|entries| {
                entries
                    .iter()
                    .skip(cursor.memory_index)
                    .map(LogEntry::render)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The last `max` rendered lines for a node (any attempt).
    #[must_use]
    pub fn tail(&self, plan_id: PlanId, node_id: &NodeId, max: usize) -> Vec<String> {
        let map = self.lock();
        map.get(&(plan_id, node_id.clone()))
            .map(|entries| {
                let start = entries.len().saturating_sub(max);
                entries[start..].iter().map(LogEntry::render).collect()
            })
            .unwrap_or_default()
    }

    /// The rendered lines one phase produced (any attempt).
    #[must_use]
    pub fn for_phase(&self, plan_id: PlanId, node_id: &NodeId, phase: Phase) -> Vec<String> {
        let map = self.lock();
        map.get(&(plan_id, node_id.clone()))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.phase == Some(phase))
                    .map(LogEntry::render)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a plan's in-memory entries (called on plan delete).
    pub fn forget_plan(&self, plan_id: PlanId) {
        let mut map = self.lock();
        map.retain(|(p, _), _| *p != plan_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeKey, Vec<LogEntry>>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
