//! Per-node spec storage: attempt snapshots and the `current` pointer.
//!
//! Each node owns a `specs/<nodeId>/` subtree. Attempt N's spec documents
//! live in `attempts/<N>/`; `current` points at the attempt directory in
//! use (a symlink on POSIX, a relative-path pointer file elsewhere).
//!
//! Agent-typed phases split their instructions into a sibling markdown
//! file and store a reference, keeping the JSON documents small and the
//! instructions editable with ordinary tools. Reads rehydrate.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::plan::PhaseSpec;
use crate::model::types::{NodeId, PlanId};
use crate::model::{JobPhases, Phase, Plan};
use crate::store::layout::StorageLayout;
use crate::store::plan_doc::{read_json_opt, write_json_atomic, PlanStore, StoreError};

// ---------------------------------------------------------------------------
// Stored phase document
// ---------------------------------------------------------------------------

/// The on-disk form of a phase spec. Agent instructions are externalized.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoredPhaseDoc {
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
        env: std::collections::BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Agent {
        /// Filename of the sibling markdown file holding the instructions.
        instructions_ref: String,
    },
}

impl PlanStore {
    // -----------------------------------------------------------------------
    // Node spec read/write
    // -----------------------------------------------------------------------

    /// Read the spec for one phase slot from the node's current attempt
    /// directory. `None` when the slot has no document.
    ///
    /// # Errors
    /// Corrupt documents, missing instruction files, and I/O failures
    /// propagate.
    pub fn read_node_spec(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        phase: Phase,
    ) -> Result<Option<PhaseSpec>, StoreError> {
        let doc_name =
            StorageLayout::phase_doc_name(phase).ok_or(StoreError::NotAJobPhase { phase })?;
        let Some(dir) = self.resolve_current(plan_id, node_id) else {
            return Ok(None);
        };
        let path = dir.join(doc_name);
        let Some(doc) = read_json_opt::<StoredPhaseDoc>(&path)? else {
            return Ok(None);
        };
        let spec = match doc {
            StoredPhaseDoc::Shell {
                command,
                timeout_ms,
            } => PhaseSpec::Shell {
                command,
                timeout_ms,
            },
            StoredPhaseDoc::Process {
                program,
                args,
                env,
                timeout_ms,
            } => PhaseSpec::Process {
                program,
                args,
                env,
                timeout_ms,
            },
            StoredPhaseDoc::Agent { instructions_ref } => {
                let md_path = dir.join(&instructions_ref);
                let instructions =
                    fs::read_to_string(&md_path).map_err(|e| StoreError::io(&md_path, e))?;
                PhaseSpec::Agent { instructions }
            }
        };
        Ok(Some(spec))
    }

    /// Write the spec for one phase slot into the node's current attempt
    /// directory, creating a plain `current` directory when the node has
    /// no attempts yet.
    ///
    /// # Errors
    /// I/O and serialization failures propagate.
    pub fn write_node_spec(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        phase: Phase,
        spec: &PhaseSpec,
    ) -> Result<(), StoreError> {
        let doc_name =
            StorageLayout::phase_doc_name(phase).ok_or(StoreError::NotAJobPhase { phase })?;
        let dir = match self.resolve_current(plan_id, node_id) {
            Some(dir) => dir,
            None => {
                // Before the first snapshot, specs accumulate in a plain
                // directory that snapshot 1 will promote.
                let dir = self.layout.current_entry(plan_id, node_id);
                fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
                dir
            }
        };

        let doc = match spec {
            PhaseSpec::Shell {
                command,
                timeout_ms,
            } => StoredPhaseDoc::Shell {
                command: command.clone(),
                timeout_ms: *timeout_ms,
            },
            PhaseSpec::Process {
                program,
                args,
                env,
                timeout_ms,
            } => StoredPhaseDoc::Process {
                program: program.clone(),
                args: args.clone(),
                env: env.clone(),
                timeout_ms: *timeout_ms,
            },
            PhaseSpec::Agent { instructions } => {
                let md_name = StorageLayout::phase_instructions_name(phase)
                    .ok_or(StoreError::NotAJobPhase { phase })?;
                let md_path = dir.join(md_name);
                fs::write(&md_path, instructions).map_err(|e| StoreError::io(&md_path, e))?;
                StoredPhaseDoc::Agent {
                    instructions_ref: md_name.to_owned(),
                }
            }
        };
        write_json_atomic(&dir.join(doc_name), &doc)
    }

    /// Persist every phase spec a node carries.
    ///
    /// # Errors
    /// I/O and serialization failures propagate.
    pub fn write_node_phases(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        phases: &JobPhases,
    ) -> Result<(), StoreError> {
        for phase in [Phase::Prechecks, Phase::Work, Phase::Postchecks] {
            if let Some(spec) = phases.slot(phase) {
                self.write_node_spec(plan_id, node_id, phase, spec)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attempt snapshots
    // -----------------------------------------------------------------------

    /// Prepare the spec directory for attempt `n` and retarget `current`.
    ///
    /// Attempt 1 promotes a pre-existing plain `current` directory;
    /// attempt N copies attempt N-1's spec files. The execution log is
    /// never copied: every attempt starts with a fresh log.
    ///
    /// # Errors
    /// I/O failures propagate.
    pub fn snapshot_specs_for_attempt(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        attempt: u32,
    ) -> Result<PathBuf, StoreError> {
        let attempt_dir = self.attempt_dir(plan_id, node_id, attempt);
        if attempt_dir.exists() {
            // Re-dispatch after a crash between snapshot and persist.
            self.retarget_current(plan_id, node_id, attempt)?;
            return Ok(attempt_dir);
        }

        let current = self.layout.current_entry(plan_id, node_id);
        if attempt <= 1 {
            let promotable = current.is_dir() && !current.is_symlink();
            if promotable {
                let attempts_parent = self.layout.attempts_dir(plan_id, node_id);
                fs::create_dir_all(&attempts_parent)
                    .map_err(|e| StoreError::io(&attempts_parent, e))?;
                fs::rename(&current, &attempt_dir).map_err(|e| StoreError::io(&current, e))?;
                debug!(node = %node_id, "promoted staged specs into first attempt");
            } else {
                fs::create_dir_all(&attempt_dir).map_err(|e| StoreError::io(&attempt_dir, e))?;
            }
        } else {
            fs::create_dir_all(&attempt_dir).map_err(|e| StoreError::io(&attempt_dir, e))?;
            let previous = self.attempt_dir(plan_id, node_id, attempt - 1);
            copy_spec_files(&previous, &attempt_dir)?;
        }

        self.retarget_current(plan_id, node_id, attempt)?;
        Ok(attempt_dir)
    }

    /// Resolve the `current` entry to the directory it designates.
    #[must_use]
    pub fn resolve_current(&self, plan_id: PlanId, node_id: &NodeId) -> Option<PathBuf> {
        let entry = self.layout.current_entry(plan_id, node_id);
        if entry.is_symlink() {
            let target = fs::read_link(&entry).ok()?;
            let resolved = if target.is_absolute() {
                target
            } else {
                entry.parent()?.join(target)
            };
            return resolved.is_dir().then_some(resolved);
        }
        if entry.is_dir() {
            return Some(entry);
        }
        // Pointer-file form: the file contains a relative target.
        if entry.is_file() {
            let target = fs::read_to_string(&entry).ok()?;
            let resolved = entry.parent()?.join(target.trim());
            return resolved.is_dir().then_some(resolved);
        }
        None
    }

    /// Point `current` at `attempts/<n>`.
    fn retarget_current(
        &self,
        plan_id: PlanId,
        node_id: &NodeId,
        attempt: u32,
    ) -> Result<(), StoreError> {
        let entry = self.layout.current_entry(plan_id, node_id);
        match fs::symlink_metadata(&entry) {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(&entry).map_err(|e| StoreError::io(&entry, e))?;
            }
            Ok(_) => {
                fs::remove_file(&entry).map_err(|e| StoreError::io(&entry, e))?;
            }
            Err(_) => {}
        }
        let target = PathBuf::from("attempts").join(attempt.to_string());
        point_current_at(&entry, &target)
    }

    // -----------------------------------------------------------------------
    // File import
    // -----------------------------------------------------------------------

    /// Move a file from the user's workspace into the node's current spec
    /// directory, refusing sources outside `workspace` and unsafe
    /// basenames.
    ///
    /// # Errors
    /// [`StoreError::OutsideWorkspace`], [`StoreError::UnsafeFileName`],
    /// and I/O failures propagate.
    pub fn move_file_to_spec(
        &self,
        workspace: &Path,
        source: &Path,
        plan_id: PlanId,
        node_id: &NodeId,
    ) -> Result<PathBuf, StoreError> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::UnsafeFileName {
                name: source.display().to_string(),
            })?;
        if matches!(name.as_str(), "." | ".." | ".git") {
            return Err(StoreError::UnsafeFileName { name });
        }

        let workspace_real = fs::canonicalize(workspace).map_err(|e| StoreError::io(workspace, e))?;
        let source_real = fs::canonicalize(source).map_err(|e| StoreError::io(source, e))?;
        if !source_real.starts_with(&workspace_real) {
            return Err(StoreError::OutsideWorkspace { path: source_real });
        }

        let dir = match self.resolve_current(plan_id, node_id) {
            Some(dir) => dir,
            None => {
                let dir = self.layout.current_entry(plan_id, node_id);
                fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
                dir
            }
        };
        let dest = dir.join(&name);
        // Rename first; fall back to copy+remove across filesystems.
        if fs::rename(&source_real, &dest).is_err() {
            fs::copy(&source_real, &dest).map_err(|e| StoreError::io(&dest, e))?;
            fs::remove_file(&source_real).map_err(|e| StoreError::io(&source_real, e))?;
        }
        Ok(dest)
    }

    // -----------------------------------------------------------------------
    // Legacy migration
    // -----------------------------------------------------------------------

    /// Attempt to read a plan document in the legacy single-document
    /// schema (phase specs embedded in plan.json) and rewrite it in the
    /// split form.
    pub(crate) fn try_migrate_legacy(&self, plan_id: PlanId) -> Result<Option<Plan>, StoreError> {
        let path = self.layout.plan_doc(plan_id);
        let Some(doc) = read_json_opt::<LegacyPlanDoc>(&path)? else {
            return Ok(None);
        };
        info!(plan = %plan_id, "migrating legacy plan document to split schema");
        for (node_id, phases) in &doc.specs {
            self.write_node_phases(plan_id, node_id, phases)?;
        }
        self.write_plan(&doc.plan)?;
        Ok(Some(doc.plan))
    }
}

/// The legacy schema: the plan plus an embedded spec map.
#[derive(Debug, Deserialize)]
struct LegacyPlanDoc {
    plan: Plan,
    #[serde(default)]
    specs: std::collections::BTreeMap<NodeId, JobPhases>,
}

/// Copy spec documents (JSON + markdown) between attempt directories,
/// skipping the execution log.
fn copy_spec_files(from: &Path, to: &Path) -> Result<(), StoreError> {
    let entries = match fs::read_dir(from) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(from, e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy() == StorageLayout::EXECUTION_LOG {
            continue;
        }
        let src = entry.path();
        if src.is_file() {
            let dest = to.join(&name);
            fs::copy(&src, &dest).map_err(|e| StoreError::io(&dest, e))?;
        }
    }
    Ok(())
}

/// Create the `current` entry pointing at `target` (relative to the node
/// directory). Symlink on POSIX; a pointer file elsewhere.
#[cfg(unix)]
fn point_current_at(entry: &Path, target: &Path) -> Result<(), StoreError> {
    std::os::unix::fs::symlink(target, entry).map_err(|e| StoreError::io(entry, e))
}

#[cfg(not(unix))]
fn point_current_at(entry: &Path, target: &Path) -> Result<(), StoreError> {
    fs::write(entry, target.to_string_lossy().as_bytes()).map_err(|e| StoreError::io(entry, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::{JobSpec, NodeKind, PlanSpec};
    use tempfile::TempDir;

    fn store() -> (TempDir, PlanStore) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path().join("storage")).unwrap();
        (dir, store)
    }

    fn node() -> NodeId {
        NodeId::new("build").unwrap()
    }

    fn shell(cmd: &str) -> PhaseSpec {
        PhaseSpec::Shell {
            command: cmd.to_owned(),
            timeout_ms: None,
        }
    }

    // -- spec read/write --

    #[test]
    fn spec_roundtrip_shell() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        store
            .write_node_spec(plan, &node(), Phase::Work, &shell("make"))
            .unwrap();
        let back = store.read_node_spec(plan, &node(), Phase::Work).unwrap();
        assert_eq!(back, Some(shell("make")));
    }

    #[test]
    fn spec_missing_is_none() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        assert_eq!(
            store.read_node_spec(plan, &node(), Phase::Work).unwrap(),
            None
        );
    }

    #[test]
    fn spec_for_merge_phase_is_rejected() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        let err = store
            .read_node_spec(plan, &node(), Phase::MergeRi)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotAJobPhase { .. }));
    }

    #[test]
    fn agent_spec_splits_instructions_into_markdown() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        let agent = PhaseSpec::Agent {
            instructions: "# Task\nDo the thing.\n".to_owned(),
        };
        store
            .write_node_spec(plan, &node(), Phase::Work, &agent)
            .unwrap();

        let dir = store.resolve_current(plan, &node()).unwrap();
        let doc = fs::read_to_string(dir.join("work.json")).unwrap();
        assert!(doc.contains("instructions_ref"));
        assert!(!doc.contains("Do the thing"));
        let md = fs::read_to_string(dir.join("work.md")).unwrap();
        assert!(md.contains("Do the thing"));

        // Reads rehydrate.
        let back = store.read_node_spec(plan, &node(), Phase::Work).unwrap();
        assert_eq!(back, Some(agent));
    }

    // -- snapshots --

    #[test]
    fn first_snapshot_promotes_staged_directory() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        store
            .write_node_spec(plan, &node(), Phase::Work, &shell("make"))
            .unwrap();

        let attempt_dir = store.snapshot_specs_for_attempt(plan, &node(), 1).unwrap();
        assert!(attempt_dir.ends_with("attempts/1"));
        assert!(attempt_dir.join("work.json").exists());
        // current now resolves to attempts/1.
        assert_eq!(store.resolve_current(plan, &node()).unwrap(), attempt_dir);
    }

    #[test]
    fn later_snapshots_copy_specs_but_not_logs() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        store
            .write_node_spec(plan, &node(), Phase::Work, &shell("make"))
            .unwrap();
        let first = store.snapshot_specs_for_attempt(plan, &node(), 1).unwrap();
        fs::write(first.join(StorageLayout::EXECUTION_LOG), "old logs\n").unwrap();

        let second = store.snapshot_specs_for_attempt(plan, &node(), 2).unwrap();
        assert!(second.ends_with("attempts/2"));
        assert!(second.join("work.json").exists());
        assert!(!second.join(StorageLayout::EXECUTION_LOG).exists());
        assert_eq!(store.resolve_current(plan, &node()).unwrap(), second);
        // Attempt 1's log is untouched.
        assert!(first.join(StorageLayout::EXECUTION_LOG).exists());
    }

    #[test]
    fn snapshot_is_idempotent_for_the_same_attempt() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        store
            .write_node_spec(plan, &node(), Phase::Work, &shell("make"))
            .unwrap();
        let a = store.snapshot_specs_for_attempt(plan, &node(), 1).unwrap();
        let b = store.snapshot_specs_for_attempt(plan, &node(), 1).unwrap();
        assert_eq!(a, b);
        assert!(a.join("work.json").exists());
    }

    #[test]
    fn writes_after_snapshot_land_in_the_attempt_dir() {
        let (_dir, store) = store();
        let plan = PlanId::generate();
        store
            .write_node_spec(plan, &node(), Phase::Work, &shell("one"))
            .unwrap();
        let attempt_dir = store.snapshot_specs_for_attempt(plan, &node(), 1).unwrap();
        store
            .write_node_spec(plan, &node(), Phase::Work, &shell("two"))
            .unwrap();
        let doc = fs::read_to_string(attempt_dir.join("work.json")).unwrap();
        assert!(doc.contains("two"));
    }

    // -- move_file_to_spec --

    #[test]
    fn move_file_from_workspace() {
        let (dir, store) = store();
        let plan = PlanId::generate();
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let source = workspace.join("notes.md");
        fs::write(&source, "notes\n").unwrap();

        let dest = store
            .move_file_to_spec(&workspace, &source, plan, &node())
            .unwrap();
        assert!(dest.exists());
        assert!(!source.exists());
        assert_eq!(fs::read_to_string(dest).unwrap(), "notes\n");
    }

    #[test]
    fn move_file_outside_workspace_is_refused() {
        let (dir, store) = store();
        let plan = PlanId::generate();
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let outside = dir.path().join("outside.md");
        fs::write(&outside, "secret\n").unwrap();

        let err = store
            .move_file_to_spec(&workspace, &outside, plan, &node())
            .unwrap_err();
        assert!(matches!(err, StoreError::OutsideWorkspace { .. }));
        assert!(outside.exists());
    }

    #[test]
    fn move_file_escaping_via_dotdot_is_refused() {
        let (dir, store) = store();
        let plan = PlanId::generate();
        let workspace = dir.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        let outside = dir.path().join("outside.md");
        fs::write(&outside, "secret\n").unwrap();
        let sneaky = workspace.join("..").join("outside.md");

        let err = store
            .move_file_to_spec(&workspace, &sneaky, plan, &node())
            .unwrap_err();
        assert!(matches!(err, StoreError::OutsideWorkspace { .. }));
    }

    #[test]
    fn move_git_dir_is_refused() {
        let (dir, store) = store();
        let plan = PlanId::generate();
        let workspace = dir.path().join("ws");
        fs::create_dir_all(workspace.join(".git")).unwrap();
        let err = store
            .move_file_to_spec(&workspace, &workspace.join(".git"), plan, &node())
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsafeFileName { .. }));
    }

    // -- legacy migration --

    #[test]
    fn legacy_document_is_migrated_on_read() {
        let (_dir, store) = store();
        let spec = PlanSpec {
            name: "legacy".to_owned(),
            jobs: vec![JobSpec {
                id: "build".to_owned(),
                depends_on: vec![],
                kind: NodeKind::Job(JobPhases {
                    prechecks: None,
                    work: Some(shell("make")),
                    postchecks: None,
                }),
                auto_heal: true,
                expects_no_changes: false,
            }],
            base_branch: "main".to_owned(),
            target_branch: None,
            max_parallel: 1,
        };
        let plan = Plan::build(PlanId::generate(), spec, PathBuf::from("/repo")).unwrap();
        let plan_id = plan.id;

        // Write the legacy single-document schema by hand.
        let mut specs = std::collections::BTreeMap::new();
        specs.insert(
            node(),
            JobPhases {
                prechecks: None,
                work: Some(shell("make")),
                postchecks: None,
            },
        );
        let legacy = serde_json::json!({
            "plan": plan,
            "specs": specs,
        });
        let path = store.layout.plan_doc(plan_id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_vec_pretty(&legacy).unwrap()).unwrap();

        let loaded = store.read_plan(plan_id).unwrap().unwrap();
        assert_eq!(loaded.id, plan_id);
        // Specs were split out...
        assert_eq!(
            store.read_node_spec(plan_id, &node(), Phase::Work).unwrap(),
            Some(shell("make"))
        );
        // ...and the document was rewritten in the new schema.
        let reread = store.read_plan(plan_id).unwrap().unwrap();
        assert_eq!(reread, loaded);
    }
}
