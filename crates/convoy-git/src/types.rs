//! Core types for the convoy git gateway.
//!
//! These types form the vocabulary shared between the
//! [`GitGateway`](crate::GitGateway) trait and the orchestrator crate. They
//! intentionally contain no backend types — whether the gateway is backed by
//! the git CLI, a library, or a test double is an implementation detail.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// A git object identifier (SHA-1, 20 bytes).
///
/// Stored as raw bytes for efficient comparison, hashing, and Copy
/// semantics. Displays as (and serializes to) 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitOid([u8; 20]);

impl GitOid {
    /// The zero OID (`0000...0000`), used as a sentinel for "ref does not
    /// exist" in compare-and-swap ref updates.
    pub const ZERO: Self = Self([0; 20]);

    /// Create a `GitOid` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Return `true` if this is the zero OID.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The abbreviated 8-character hex prefix, as used for worktree
    /// directory names and human-facing summaries.
    #[must_use]
    pub fn short(&self) -> String {
        let mut s = String::with_capacity(8);
        for byte in &self.0[..4] {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GitOid({self})")
    }
}

const fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

impl FromStr for GitOid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(OidParseError {
                value: s.to_owned(),
                reason: format!("expected 40 hex characters, got {}", s.len()),
            });
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0]).ok_or_else(|| OidParseError {
                value: s.to_owned(),
                reason: format!("invalid hex digit '{}'", chunk[0] as char),
            })?;
            let lo = hex_digit(chunk[1]).ok_or_else(|| OidParseError {
                value: s.to_owned(),
                reason: format!("invalid hex digit '{}'", chunk[1] as char),
            })?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for GitOid {
    type Error = OidParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GitOid> for String {
    fn from(oid: GitOid) -> Self {
        oid.to_string()
    }
}

/// Error returned when parsing a [`GitOid`] from a string fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidParseError {
    /// The raw value that failed to parse.
    pub value: String,
    /// Why parsing failed.
    pub reason: String,
}

impl fmt::Display for OidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid git OID `{}`: {}", self.value, self.reason)
    }
}

impl std::error::Error for OidParseError {}

// ---------------------------------------------------------------------------
// WorktreeCreation
// ---------------------------------------------------------------------------

/// The result of creating (or reusing) a detached worktree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeCreation {
    /// The commit the worktree's HEAD is detached at. For a fresh worktree
    /// this is the resolved base commitish; for a reused worktree it is the
    /// worktree's current HEAD.
    pub base_commit: GitOid,
    /// Whether an existing worktree at the path was reused.
    pub reused: bool,
    /// Wall-clock time the operation took, in milliseconds.
    pub total_ms: u64,
}

// ---------------------------------------------------------------------------
// Merge results
// ---------------------------------------------------------------------------

/// The outcome of a working-tree merge (`git merge` inside a worktree).
///
/// A conflicted merge is a *result*, not an error: the caller decides
/// whether to delegate to a resolver or abort.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Whether the merge completed cleanly.
    pub success: bool,
    /// Whether the merge stopped on conflicts.
    pub has_conflicts: bool,
    /// Paths of conflicted files (relative to the worktree root).
    pub conflict_files: Vec<String>,
    /// Git's error output for failures that are neither clean nor
    /// conflicts (e.g. unrelated histories).
    pub error: Option<String>,
}

/// The outcome of an in-memory merge (`git merge-tree --write-tree`).
///
/// No working tree or index is touched. A clean merge yields the merged
/// tree OID; a conflicted merge yields the conflicted file list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeTreeOutcome {
    /// The merged tree, present only when the merge was clean.
    pub tree: Option<GitOid>,
    /// Paths of conflicted files when the merge was not clean.
    pub conflict_files: Vec<String>,
}

impl MergeTreeOutcome {
    /// Returns `true` if the merge produced a usable tree with no conflicts.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.tree.is_some() && self.conflict_files.is_empty()
    }
}

// ---------------------------------------------------------------------------
// History inspection
// ---------------------------------------------------------------------------

/// Metadata for one commit, as read from `git log`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    /// The commit OID.
    pub id: GitOid,
    /// Abbreviated hash as git printed it.
    pub short_id: String,
    /// First line of the commit message.
    pub summary: String,
}

/// One changed file in a tree-to-tree diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    /// The change kind.
    pub status: DiffStatus,
    /// Path relative to the repository root.
    pub path: String,
}

/// The kind of change a [`DiffEntry`] represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiffStatus {
    /// File added.
    Added,
    /// File deleted.
    Deleted,
    /// File modified (including renames and copies, which git reports
    /// with their own letters but convoy folds into modification).
    Modified,
}

impl DiffStatus {
    /// Map a `git diff --name-status` letter to a status.
    #[must_use]
    pub const fn from_letter(letter: char) -> Self {
        match letter {
            'A' => Self::Added,
            'D' => Self::Deleted,
            _ => Self::Modified,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "0123456789abcdef0123456789abcdef01234567";

    // -- GitOid --

    #[test]
    fn oid_roundtrip() {
        let oid: GitOid = SAMPLE.parse().unwrap();
        assert_eq!(oid.to_string(), SAMPLE);
    }

    #[test]
    fn oid_short_is_first_eight_chars() {
        let oid: GitOid = SAMPLE.parse().unwrap();
        assert_eq!(oid.short(), "01234567");
    }

    #[test]
    fn oid_rejects_wrong_length() {
        let err = "abc".parse::<GitOid>().unwrap_err();
        assert!(err.reason.contains("40 hex characters"));
    }

    #[test]
    fn oid_rejects_uppercase() {
        let bad = SAMPLE.to_uppercase();
        assert!(bad.parse::<GitOid>().is_err());
    }

    #[test]
    fn oid_rejects_non_hex() {
        let bad = "z".repeat(40);
        assert!(bad.parse::<GitOid>().is_err());
    }

    #[test]
    fn zero_oid_is_zero() {
        assert!(GitOid::ZERO.is_zero());
        let oid: GitOid = SAMPLE.parse().unwrap();
        assert!(!oid.is_zero());
    }

    #[test]
    fn oid_debug_format() {
        let oid: GitOid = SAMPLE.parse().unwrap();
        assert_eq!(format!("{oid:?}"), format!("GitOid({SAMPLE})"));
    }

    // -- MergeTreeOutcome --

    #[test]
    fn merge_tree_clean() {
        let outcome = MergeTreeOutcome {
            tree: Some(SAMPLE.parse().unwrap()),
            conflict_files: vec![],
        };
        assert!(outcome.is_clean());
    }

    #[test]
    fn merge_tree_conflicted_is_not_clean() {
        let outcome = MergeTreeOutcome {
            tree: Some(SAMPLE.parse().unwrap()),
            conflict_files: vec!["src/lib.rs".to_owned()],
        };
        assert!(!outcome.is_clean());
    }

    // -- DiffStatus --

    #[test]
    fn diff_status_letters() {
        assert_eq!(DiffStatus::from_letter('A'), DiffStatus::Added);
        assert_eq!(DiffStatus::from_letter('D'), DiffStatus::Deleted);
        assert_eq!(DiffStatus::from_letter('M'), DiffStatus::Modified);
        assert_eq!(DiffStatus::from_letter('R'), DiffStatus::Modified);
    }
}
