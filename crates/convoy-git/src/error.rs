//! Error types for git gateway operations.
//!
//! [`GitError`] is the single error type returned by all
//! [`GitGateway`](crate::GitGateway) trait methods. It uses rich enum
//! variants so callers can match on specific failure modes (missing ref,
//! lock contention, rejected push) without parsing error messages.

use thiserror::Error;

/// Errors returned by [`GitGateway`](crate::GitGateway) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A requested object, ref, or path was not found.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },

    /// An OID string could not be parsed or was otherwise invalid.
    #[error("invalid OID `{value}`: {reason}")]
    InvalidOid {
        /// The raw value that failed validation.
        value: String,
        /// Why validation failed.
        reason: String,
    },

    /// A ref update could not take the ref lock (e.g. `index.lock` or a
    /// per-ref lock file held by a concurrent git process).
    ///
    /// Callers may retry this after a short delay; the contention is
    /// usually transient.
    #[error("ref `{ref_name}` is locked: {message}")]
    RefLocked {
        /// The ref that could not be locked.
        ref_name: String,
        /// Stderr from git describing the lock.
        message: String,
    },

    /// A ref update failed because the ref's current value did not match
    /// the expected old value (compare-and-swap failure).
    #[error("ref conflict on `{ref_name}`: {message}")]
    RefConflict {
        /// The ref that could not be updated.
        ref_name: String,
        /// Details about the mismatch.
        message: String,
    },

    /// A push to a remote was rejected or failed.
    #[error("push to `{remote}` failed: {message}")]
    PushFailed {
        /// The remote name (e.g., `"origin"`).
        remote: String,
        /// Details about the failure.
        message: String,
    },

    /// An I/O error occurred (process spawn, pipe, file system).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A git command exited unsuccessfully in a way no other variant covers.
    ///
    /// The `command` is the logical git invocation (e.g. `"git worktree
    /// add"`), and `stderr` is git's trimmed error output.
    #[error("git command failed: {command}: {stderr}")]
    CommandFailed {
        /// The git command that was run.
        command: String,
        /// Captured stderr from git.
        stderr: String,
        /// Process exit code, if the process exited normally.
        exit_code: Option<i32>,
    },
}

impl GitError {
    /// Returns `true` if this error is transient lock contention that a
    /// caller may reasonably retry.
    #[must_use]
    pub const fn is_lock_contention(&self) -> bool {
        matches!(self, Self::RefLocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_locked_is_lock_contention() {
        let err = GitError::RefLocked {
            ref_name: "refs/heads/main".to_owned(),
            message: "unable to create lock".to_owned(),
        };
        assert!(err.is_lock_contention());
    }

    #[test]
    fn command_failed_is_not_lock_contention() {
        let err = GitError::CommandFailed {
            command: "git merge".to_owned(),
            stderr: "fatal".to_owned(),
            exit_code: Some(128),
        };
        assert!(!err.is_lock_contention());
    }

    #[test]
    fn display_includes_command_and_stderr() {
        let err = GitError::CommandFailed {
            command: "git worktree add".to_owned(),
            stderr: "fatal: already exists".to_owned(),
            exit_code: Some(128),
        };
        let msg = format!("{err}");
        assert!(msg.contains("git worktree add"));
        assert!(msg.contains("already exists"));
    }
}
