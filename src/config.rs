//! Orchestrator configuration (`convoy.toml`).
//!
//! Typed configuration for the keys the core consumes. Missing fields use
//! sensible defaults; a missing file is all defaults (no error). Every
//! other knob belongs to external collaborators and has no business here.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::resolver::MergePreference;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level orchestrator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvoyConfig {
    /// Where plan documents and attempt artifacts live.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Repository used when a plan spec names none.
    #[serde(default)]
    pub default_repo_path: Option<PathBuf>,

    /// Global ceiling on concurrently running work-performing nodes.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Pump tick interval in milliseconds.
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,

    /// Remove worktrees of succeeded nodes once their output is consumed.
    #[serde(default = "default_clean_up")]
    pub clean_up_successful_work: bool,

    /// Merge behavior.
    #[serde(default)]
    pub merge: MergeConfig,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".convoy")
}

const fn default_max_parallel() -> usize {
    8
}

const fn default_pump_interval_ms() -> u64 {
    1000
}

const fn default_clean_up() -> bool {
    true
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Reverse-integration behavior.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Push the target branch after a successful merge. A push failure is
    /// logged but never fails the merge.
    #[serde(default)]
    pub push_on_success: bool,

    /// Side preference handed to the conflict resolver.
    #[serde(default)]
    pub prefer: MergePreference,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A configuration file failed to load or parse.
#[derive(Debug)]
pub struct ConfigError {
    /// The file, when one was involved.
    pub path: Option<PathBuf>,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(
                f,
                "configuration error in '{}': {}\n  To fix: edit the config file and correct the issue.",
                path.display(),
                self.message
            ),
            None => write!(f, "configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConvoyConfig {
    /// Load from a TOML file. A missing file yields all defaults.
    ///
    /// # Errors
    /// Unreadable or malformed files (including unknown keys) fail.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::defaults()),
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_path_buf()),
                    message: e.to_string(),
                });
            }
        };
        toml::from_str(&content).map_err(|e| ConfigError {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })
    }

    /// The all-defaults configuration.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            storage_path: default_storage_path(),
            default_repo_path: None,
            max_parallel: default_max_parallel(),
            pump_interval_ms: default_pump_interval_ms(),
            clean_up_successful_work: default_clean_up(),
            merge: MergeConfig::default(),
        }
    }
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
