//! Foundation types for convoy plans.
//!
//! Identifiers used throughout the orchestrator: plan identifiers (UUID),
//! node identifiers (validated slugs), and the validation error they share.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PlanId
// ---------------------------------------------------------------------------

/// A plan identifier — a UUID assigned at plan creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    /// Generate a fresh random plan identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanId({})", self.0)
    }
}

impl FromStr for PlanId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|e| ValidationError {
            kind: ErrorKind::PlanId,
            value: s.to_owned(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A node identifier within one plan.
///
/// Derived from the user-supplied producer ID at plan build time. Must be
/// 1–64 characters of lowercase alphanumerics, hyphens, underscores, or
/// dots — safe to embed in directory names and log file names without
/// escaping.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a validated node identifier.
    ///
    /// # Errors
    /// Returns an error if the name is empty, too long, or contains a
    /// character outside the allowed set.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first eight characters (or the whole ID when shorter), used for
    /// worktree directory names.
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() || s.len() > 64 {
            return Err(ValidationError {
                kind: ErrorKind::NodeId,
                value: s.to_owned(),
                reason: format!("length must be 1-64 characters, got {}", s.len()),
            });
        }
        if let Some(bad) = s.chars().find(|c| {
            !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        }) {
            return Err(ValidationError {
                kind: ErrorKind::NodeId,
                value: s.to_owned(),
                reason: format!(
                    "character '{bad}' is not allowed (lowercase alphanumerics, '-', '_', '.')"
                ),
            });
        }
        if s.starts_with('.') {
            return Err(ValidationError {
                kind: ErrorKind::NodeId,
                value: s.to_owned(),
                reason: "must not start with '.'".to_owned(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which identifier kind failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A plan identifier.
    PlanId,
    /// A node identifier.
    NodeId,
}

/// An identifier failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// Which identifier kind was being validated.
    pub kind: ErrorKind,
    /// The raw value that failed.
    pub value: String,
    /// Why validation failed.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ErrorKind::PlanId => "plan id",
            ErrorKind::NodeId => "node id",
        };
        write!(f, "invalid {what} '{}': {}", self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Wall-clock time
// ---------------------------------------------------------------------------

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Clock skew before 1970 collapses to zero rather than panicking.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- PlanId --

    #[test]
    fn plan_id_roundtrips_through_string() {
        let id = PlanId::generate();
        let parsed: PlanId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn plan_id_rejects_garbage() {
        let err = "not-a-uuid".parse::<PlanId>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlanId);
    }

    #[test]
    fn plan_id_serde_is_transparent() {
        let id = PlanId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    // -- NodeId --

    #[test]
    fn node_id_accepts_slugs() {
        for ok in ["build", "unit-tests", "step_2", "pkg.core", "a"] {
            assert!(NodeId::new(ok).is_ok(), "{ok} should validate");
        }
    }

    #[test]
    fn node_id_rejects_bad_names() {
        for bad in ["", "Has-Upper", "with space", "a/b", "..", ".hidden"] {
            assert!(NodeId::new(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn node_id_rejects_overlong() {
        let long = "a".repeat(65);
        assert!(NodeId::new(&long).is_err());
    }

    #[test]
    fn node_id_short_prefix() {
        let id = NodeId::new("integration-tests").unwrap();
        assert_eq!(id.short(), "integrat");
        let tiny = NodeId::new("ab").unwrap();
        assert_eq!(tiny.short(), "ab");
    }

    #[test]
    fn node_id_serde_rejects_invalid() {
        let result: Result<NodeId, _> = serde_json::from_str("\"BAD NAME\"");
        assert!(result.is_err());
    }

    // -- now_ms --

    #[test]
    fn now_ms_is_nonzero() {
        assert!(now_ms() > 0);
    }
}
