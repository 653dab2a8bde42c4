//! Core data types used throughout the mrepo library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Timeline entries**: [`Snapshot`], [`Link`] - the records kept in the
//!   persisted metadata
//! - **Operation parameters**: [`SnapshotOptions`], [`LinkOptions`]
//! - **Operation results**: [`ConsistencyReport`]
//! - **Validation mode**: [`DiskCheck`]
//!
//! Snapshots and links reference each other by key (snapshot id, link name),
//! never by pointer. A link stores the id of its target snapshot and the
//! target snapshot stores the link's name in [`Snapshot::links`]; the
//! [`Timeline`](crate::Timeline) keeps both sides in step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// One materialized, tracked copy of the source tree
///
/// # Examples
///
/// ```rust
/// # use mrepo::types::Snapshot;
/// # use std::path::PathBuf;
/// # use chrono::Utc;
/// let snapshot = Snapshot::new(
///     "2015.02.12-141326".to_string(),
///     Utc::now(),
///     PathBuf::from("/srv/repo/epel.timeline/2015.02.12-141326"),
/// );
/// assert!(snapshot.links.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Timestamp-derived identifier, also the directory name
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// `destination/id`
    pub path: PathBuf,
    /// Names of the links currently pointing at this snapshot
    #[serde(default)]
    pub links: BTreeSet<String>,
    /// Diff report written when this snapshot was created, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_log_file: Option<PathBuf>,
}

impl Snapshot {
    /// Create a snapshot record without links
    pub fn new(id: String, created_at: DateTime<Utc>, path: PathBuf) -> Self {
        Self {
            id,
            created_at,
            path,
            links: BTreeSet::new(),
            diff_log_file: None,
        }
    }
}

/// A named, retargetable reference to one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link name, also the symbolic link's file name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Id of the target snapshot
    pub snapshot: String,
    /// `destination/name`
    pub path: PathBuf,
    /// Maximum offset the target may reach before rotation moves the link
    /// forward; 0 means unpinned
    #[serde(default)]
    pub max_offset: usize,
    /// Advisory threshold, stored but not evaluated
    #[serde(default)]
    pub warn_before_max_offset: usize,
}

impl Link {
    /// Whether the link is pinned to an offset window
    pub fn is_pinned(&self) -> bool {
        self.max_offset > 0
    }
}

/// Options for creating a regular snapshot
///
/// Both sleeps are plain blocking waits used to smooth load when many
/// timelines are snapshotted by the same scheduler run.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Sleep a random duration in `1s..=max` before taking the snapshot
    pub random_sleep_before: Option<Duration>,
    /// Sleep this long after the snapshot and rotation are done
    pub sleep_after: Option<Duration>,
}

impl SnapshotOptions {
    /// Options with no sleeps
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the upper bound for the random pre-snapshot sleep
    pub fn random_sleep_before(mut self, max: Duration) -> Self {
        self.random_sleep_before = Some(max);
        self
    }

    /// Set the fixed post-snapshot sleep
    pub fn sleep_after(mut self, duration: Duration) -> Self {
        self.sleep_after = Some(duration);
        self
    }
}

/// Options for creating a link
///
/// # Examples
///
/// ```rust
/// use mrepo::types::LinkOptions;
///
/// // Pinned link on the latest snapshot
/// let options = LinkOptions::new().max_offset(7);
/// assert_eq!(options.snapshot, None);
/// assert_eq!(options.max_offset, 7);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Target snapshot id; the latest snapshot when `None`
    pub snapshot: Option<String>,
    /// See [`Link::max_offset`]
    pub max_offset: usize,
    /// See [`Link::warn_before_max_offset`]
    pub warn_before_max_offset: usize,
}

impl LinkOptions {
    /// Unpinned link to the latest snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the link at a specific snapshot
    pub fn snapshot(mut self, id: impl Into<String>) -> Self {
        self.snapshot = Some(id.into());
        self
    }

    /// Pin the link to an offset window
    pub fn max_offset(mut self, max_offset: usize) -> Self {
        self.max_offset = max_offset;
        self
    }

    /// Set the advisory warning threshold
    pub fn warn_before_max_offset(mut self, value: usize) -> Self {
        self.warn_before_max_offset = value;
        self
    }
}

impl From<&Link> for LinkOptions {
    /// Attributes needed to re-create a link under another name
    fn from(link: &Link) -> Self {
        Self {
            snapshot: Some(link.snapshot.clone()),
            max_offset: link.max_offset,
            warn_before_max_offset: link.warn_before_max_offset,
        }
    }
}

/// How a missing on-disk artifact is treated by validity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCheck {
    /// Missing on disk is an error
    Strict,
    /// Missing on disk is logged and reported as `false`
    Lenient,
}

/// Metadata removed by a consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Links whose symbolic link was missing or broken
    pub removed_links: Vec<String>,
    /// Snapshots whose directory was missing
    pub removed_snapshots: Vec<String>,
}

impl ConsistencyReport {
    /// True when metadata and filesystem already agreed
    pub fn is_clean(&self) -> bool {
        self.removed_links.is_empty() && self.removed_snapshots.is_empty()
    }
}
