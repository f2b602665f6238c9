//! Core error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for core operations.
pub type ToolboxResult<T> = Result<T, ToolboxError>;

/// Errors surfaced by the lock, registry, supervisor and install layers.
#[derive(Debug, Error)]
pub enum ToolboxError {
    /// Lock marker could not be created within the timeout budget.
    #[error("could not acquire lock for {} within {:?}", path.display(), timeout)]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// Referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate name, port already claimed, or entity in the wrong state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed or incomplete entity configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The OS refused to create the child process.
    #[error("failed to spawn {name}: {source}")]
    ProcessSpawnFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The process tree could not be confirmed dead.
    #[error("failed to terminate {name} (pid {pid}): {reason}")]
    ProcessTerminationFailure {
        name: String,
        pid: u32,
        reason: String,
    },

    /// Archive download failed.
    #[error("download failed: {0}")]
    DownloadFailure(String),

    /// Archive extraction failed.
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be parsed or serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolboxError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
