//! Plan document persistence: atomic plan.json writes and the plans index.
//!
//! Every write is atomic (temp file in the same directory + fsync +
//! rename) so a crash never leaves a half-written document. Reads of a
//! missing file return `None`; a corrupt document is an error the caller
//! decides how to handle (plan loading skips it with a warning rather than
//! aborting the process).

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::types::{NodeId, PlanId};
use crate::model::{Phase, Plan};
use crate::store::layout::StorageLayout;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from the persistent store.
#[derive(Debug)]
pub enum StoreError {
    /// An I/O operation failed.
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A document could not be serialized or parsed.
    Json {
        /// The document path.
        path: PathBuf,
        /// The underlying error.
        source: serde_json::Error,
    },

    /// A file move was refused because the source is outside the declared
    /// workspace.
    OutsideWorkspace {
        /// The offending source path.
        path: PathBuf,
    },

    /// A file move was refused because of its basename.
    UnsafeFileName {
        /// The offending name.
        name: String,
    },

    /// A spec operation was requested for a phase that has no spec
    /// document (merges, commit).
    NotAJobPhase {
        /// The offending phase.
        phase: Phase,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(
                    f,
                    "I/O error at '{}': {source}\n  To fix: check file permissions and disk space.",
                    path.display()
                )
            }
            Self::Json { path, source } => {
                write!(
                    f,
                    "malformed document '{}': {source}\n  To fix: restore the file from a backup or delete the plan.",
                    path.display()
                )
            }
            Self::OutsideWorkspace { path } => {
                write!(
                    f,
                    "refusing to import '{}': path is outside the workspace.",
                    path.display()
                )
            }
            Self::UnsafeFileName { name } => {
                write!(f, "refusing to import a file named '{name}'.")
            }
            Self::NotAJobPhase { phase } => {
                write!(f, "phase '{phase}' has no spec document.")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Atomic JSON I/O
// ---------------------------------------------------------------------------

/// Write `value` to `path` atomically: temp file in the same directory,
/// fsync, rename. A failed write removes the temp file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(|e| StoreError::io(parent, e))?;
    let write_result = tmp
        .write_all(&json)
        .and_then(|()| tmp.as_file().sync_all());
    if let Err(e) = write_result {
        // NamedTempFile removes itself on drop.
        return Err(StoreError::io(path, e));
    }
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Read and parse `path`, returning `None` when the file does not exist.
pub(crate) fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::json(path, e))
}

// ---------------------------------------------------------------------------
// Plans index
// ---------------------------------------------------------------------------

/// One row of the plans index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanIndexEntry {
    /// The plan's human-readable name.
    #[serde(default)]
    pub name: String,
    /// Creation wall-clock time (epoch milliseconds).
    #[serde(default)]
    pub created_at: u64,
    /// The repository the plan operates on.
    #[serde(default)]
    pub repo_path: PathBuf,
}

/// The `plans-index.json` document: plan IDs mapped to listing metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlansIndex {
    /// All known plans.
    #[serde(default)]
    pub plans: BTreeMap<PlanId, PlanIndexEntry>,
}

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

/// The durable per-plan store.
///
/// Owns the storage root. All operations are synchronous filesystem calls;
/// concurrency control lives with the callers (one writer per plan).
#[derive(Clone, Debug)]
pub struct PlanStore {
    pub(crate) layout: StorageLayout,
}

impl PlanStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    /// Fails if the root or its `logs/` directory cannot be created.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        let layout = StorageLayout::new(root);
        fs::create_dir_all(layout.root()).map_err(|e| StoreError::io(layout.root(), e))?;
        let logs = layout.logs_dir();
        fs::create_dir_all(&logs).map_err(|e| StoreError::io(&logs, e))?;
        Ok(Self { layout })
    }

    /// The layout in use (paths for logs, attempt dirs, ...).
    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Read a plan document. `None` when the plan does not exist on disk.
    ///
    /// Documents in the legacy single-document schema are migrated to the
    /// split form transparently (see `specs::migrate_legacy`).
    ///
    /// # Errors
    /// Corrupt documents and I/O failures propagate.
    pub fn read_plan(&self, plan_id: PlanId) -> Result<Option<Plan>, StoreError> {
        let path = self.layout.plan_doc(plan_id);
        match read_json_opt::<Plan>(&path) {
            Ok(plan) => Ok(plan),
            Err(StoreError::Json { .. }) => self.try_migrate_legacy(plan_id),
            Err(e) => Err(e),
        }
    }

    /// Write a plan document atomically and refresh its index row.
    ///
    /// # Errors
    /// I/O and serialization failures propagate.
    pub fn write_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        write_json_atomic(&self.layout.plan_doc(plan.id), plan)?;
        self.update_index(|index| {
            index.plans.insert(
                plan.id,
                PlanIndexEntry {
                    name: plan.spec.name.clone(),
                    created_at: plan.created_at,
                    repo_path: plan.repo_path.clone(),
                },
            );
        })
    }

    /// All plan IDs known to the index, merged with any plan directories
    /// the index has lost track of.
    ///
    /// # Errors
    /// I/O failures propagate; a corrupt index falls back to a directory
    /// scan.
    pub fn list_plan_ids(&self) -> Result<Vec<PlanId>, StoreError> {
        let mut ids: Vec<PlanId> = match read_json_opt::<PlansIndex>(&self.layout.index_doc()) {
            Ok(Some(index)) => index.plans.keys().copied().collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "plans index unreadable, falling back to directory scan");
                Vec::new()
            }
        };
        // Plans written by a crashed process may be missing from the index.
        let entries = match fs::read_dir(self.layout.root()) {
            Ok(entries) => entries,
            Err(e) => return Err(StoreError::io(self.layout.root(), e)),
        };
        for entry in entries.flatten() {
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<PlanId>()
                && !ids.contains(&id)
                && self.layout.plan_doc(id).exists()
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a plan's directory tree, fallback logs, and index row.
    /// Idempotent: missing files are tolerated.
    ///
    /// # Errors
    /// Only unexpected I/O failures propagate.
    pub fn delete_plan(&self, plan_id: PlanId) -> Result<(), StoreError> {
        let dir = self.layout.plan_dir(plan_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&dir, e)),
        }
        // Worktree directories live outside the plan dir; callers remove
        // them through git first, this clears whatever is left.
        let _ = fs::remove_dir_all(self.layout.worktrees_dir(plan_id));
        // Fallback logs are named <planId>_<nodeId>.log.
        if let Ok(entries) = fs::read_dir(self.layout.logs_dir()) {
            let prefix = format!("{plan_id}_");
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        self.update_index(|index| {
            index.plans.remove(&plan_id);
        })
    }

    /// Read-modify-write the plans index.
    fn update_index(&self, mutate: impl FnOnce(&mut PlansIndex)) -> Result<(), StoreError> {
        let path = self.layout.index_doc();
        let mut index = match read_json_opt::<PlansIndex>(&path) {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "plans index unreadable, rebuilding");
                PlansIndex::default()
            }
        };
        mutate(&mut index);
        write_json_atomic(&path, &index)
    }

    pub(crate) fn attempt_dir(&self, plan_id: PlanId, node_id: &NodeId, attempt: u32) -> PathBuf {
        self.layout.attempt_dir(plan_id, node_id, attempt)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
