//! Error types for the mrepo library
//!
//! This module defines all error types that can occur during timeline
//! operations. Errors fall into three groups:
//!
//! - **Validation errors** (bad names, bad settings, frozen timeline, unknown
//!   or duplicate entities). These are always raised before any in-memory or
//!   on-disk state is touched.
//! - **Consistency errors** (corrupt or mismatching metadata).
//! - **Materialization errors** raised by the filesystem layer after the
//!   metadata has already been persisted. The metadata is then "ahead" of the
//!   filesystem until [`Timeline::consistency_check`](crate::Timeline::consistency_check)
//!   repairs it.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the mrepo library
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Main error type for all timeline operations
#[derive(Debug, Error)]
pub enum TimelineError {
    /// Identifier contains characters outside `[A-Za-z0-9-_.]`
    #[error("invalid {kind} name [{name}]: only alpha-numeric characters, dots, underscores and dashes are allowed")]
    InvalidName {
        /// What was being named (timeline, snapshot, link)
        kind: &'static str,
        /// The offending value
        name: String,
    },

    /// Invalid retention limit, exclude path or other setting
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Mutation attempted while the timeline is frozen
    #[error("timeline is frozen by user [{0}]")]
    Frozen(String),

    /// Freeze attempted while the timeline is already frozen
    #[error("timeline has already been frozen by user [{0}]")]
    AlreadyFrozen(String),

    /// Snapshot id is not part of the timeline
    #[error("snapshot [{0}] not found")]
    UnknownSnapshot(String),

    /// Snapshot is tracked but its directory is missing on disk
    #[error("snapshot directory [{0:?}] not found on disk")]
    SnapshotMissing(PathBuf),

    /// Link name is not part of the timeline
    #[error("link [{0}] not found")]
    UnknownLink(String),

    /// Link is tracked but its symbolic link is missing or broken on disk
    #[error("link [{path:?}] {problem}")]
    LinkMissing {
        /// Location of the symbolic link
        path: PathBuf,
        /// `not found` or `is broken`
        problem: &'static str,
    },

    /// Link name collides with a timeline file, a snapshot or another
    /// entry of the destination directory
    #[error("link name [{name}] is already taken by {taken_by}")]
    LinkNameTaken {
        /// The requested link name
        name: String,
        /// What occupies the name
        taken_by: String,
    },

    /// Snapshot id already exists in the timeline
    #[error("snapshot [{0}] already exists")]
    DuplicateSnapshot(String),

    /// Link name already exists in the timeline
    #[error("link [{0}] already exists")]
    DuplicateLink(String),

    /// Operation needs at least one snapshot
    #[error("no snapshots were found")]
    NoSnapshots,

    /// Persisted metadata is structurally invalid or does not match
    #[error("corrupt timeline state: {0}")]
    CorruptState(String),

    /// A filesystem operation of the materializer failed
    #[error("{op} failed for {path:?}: {source}")]
    Materialization {
        /// Materializer operation name
        op: &'static str,
        /// Path the operation was acting on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O errors outside of materialization (metadata, config, reports)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization of metadata
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("configuration parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Configuration file could not be rendered
    #[error("configuration render error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Invalid copy pattern
    #[error("invalid copy pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// Walk directory error from walkdir crate
    #[error("walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl TimelineError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        TimelineError::InvalidConfig(msg.into())
    }

    /// Create a corrupt-state error with a custom message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        TimelineError::CorruptState(msg.into())
    }

    /// Wrap an I/O error raised by a materializer operation
    pub fn materialization(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TimelineError::Materialization {
            op,
            path: path.into(),
            source,
        }
    }

    /// Check if this error was raised before any state was mutated
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TimelineError::InvalidName { .. }
                | TimelineError::InvalidConfig(_)
                | TimelineError::Frozen(_)
                | TimelineError::AlreadyFrozen(_)
                | TimelineError::UnknownSnapshot(_)
                | TimelineError::SnapshotMissing(_)
                | TimelineError::UnknownLink(_)
                | TimelineError::LinkMissing { .. }
                | TimelineError::LinkNameTaken { .. }
                | TimelineError::DuplicateSnapshot(_)
                | TimelineError::DuplicateLink(_)
                | TimelineError::NoSnapshots
        )
    }

    /// Check if this error indicates corrupt metadata
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TimelineError::CorruptState(_) | TimelineError::Json(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            TimelineError::Frozen(user) => {
                format!(
                    "Timeline is frozen by [{}]. Run 'mrepo config REPOSITORY --unfreeze' once the emergency is over.",
                    user
                )
            }
            TimelineError::SnapshotMissing(path) | TimelineError::LinkMissing { path, .. } => {
                format!(
                    "{:?} is tracked but missing on disk. Run 'mrepo config REPOSITORY --consistency-check' to repair the metadata.",
                    path
                )
            }
            TimelineError::Materialization { .. } => {
                format!(
                    "{}. Metadata was already saved; run a consistency check after fixing the cause.",
                    self
                )
            }
            _ => self.to_string(),
        }
    }
}
