//! # mrepo - Repository mirror timelines
//!
//! Retention and link pinning for dated snapshots of a mirrored package
//! repository.
//!
//! ## Overview
//!
//! A timeline periodically clones a source directory (usually a package
//! mirror) into a destination directory. Each clone is a *snapshot* named
//! after its creation time. Snapshots share unchanged files with the source
//! through hard links, so keeping many of them is cheap.
//!
//! On top of the snapshots, a timeline manages *links*: named symbolic links
//! in the destination that point at one snapshot. Consumers point their
//! package managers at a link (`upstream`, `stable`, `offset007`) instead of
//! a dated snapshot.
//!
//! - Snapshots are kept in creation order and rotated out once there are
//!   more than `max_snapshots`
//! - Links follow their snapshot when it is deleted
//! - Pinned links (`max_offset > 0`) never point further back than their
//!   window and slide forward on rotation
//! - A frozen timeline rejects every mutation until it is unfrozen
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mrepo::{LinkOptions, SnapshotOptions, Timeline};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut timeline = Timeline::create(
//!     "centos-updates",
//!     "/srv/mirror/centos/updates",
//!     "/srv/repo/centos-updates.timeline",
//! )?;
//!
//! // Nightly job
//! let id = timeline.create_snapshot(SnapshotOptions::new())?;
//! println!("Created snapshot: {}", id);
//!
//! // Consumers use links
//! timeline.create_default_links()?;
//! timeline.create_link("testing", LinkOptions::new().max_offset(3))?;
//! timeline.save()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Offsets
//!
//! The offset of a snapshot counts from the newest one, which has offset 1.
//! A link with `max_offset = 7` always points at one of the seven newest
//! snapshots. When a new snapshot pushes its target out of the window, the
//! link moves to the snapshot with offset exactly 7.
//!
//! ## Persistence
//!
//! The destination holds two files next to the snapshots and links:
//!
//! - `.timeline`: JSON metadata, written atomically after every mutation
//! - `timeline.toml`: operator settings, read on open and overriding the
//!   values stored in the metadata
//!
//! The metadata is always written before the filesystem is changed. If the
//! process dies in between, [`Timeline::consistency_check`] removes the
//! entries whose files are missing.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, TimelineError>`. Validation errors
//! (invalid names, frozen timeline, unknown ids) are raised before anything
//! is modified.
//!
//! ## Module Organization
//!
//! - [`timeline`]: The timeline engine
//! - [`state`]: Persisted metadata and its invariants
//! - [`policy`]: Offset, neighbour and rotation rules
//! - [`materializer`]: Filesystem side effects
//! - [`config`]: Identity, settings file and repository defaults
//! - [`diff`]: Differences between consecutive snapshots
//! - [`lock`]: Advisory repository lock
//! - [`types`]: Common types and data structures
//! - [`utils`]: Path and file helpers shared with the `mrepo` binary
//! - [`error`]: Error types and handling

// Public API modules
pub mod config;
pub mod diff;
pub mod error;
pub mod lock;
pub mod materializer;
pub mod naming;
pub mod policy;
pub mod state;
pub mod timeline;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::{RepositoryKind, TimelineConfig, TimelineSettings};
pub use diff::{DiffEntry, DiffReporter};
pub use error::{Result, TimelineError};
pub use lock::RepositoryLock;
pub use materializer::{FsMaterializer, Materializer};
pub use state::TimelineState;
pub use timeline::{Timeline, TimelineBuilder};
pub use types::*;
