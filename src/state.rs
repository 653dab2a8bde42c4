//! Persisted timeline state
//!
//! [`TimelineState`] is the authoritative record of one timeline: its
//! configuration, the snapshot map, the ordered snapshot sequence, the link
//! map and the frozen flag. It is stored as versioned JSON in the
//! destination directory and always written as a whole (temp file, then
//! rename).
//!
//! The mutation helpers on this type are the only places that touch the
//! snapshot map, the sequence and the link map, and they keep the
//! snapshot ↔ link back-references in step:
//!
//! - [`insert_snapshot`](TimelineState::insert_snapshot) /
//!   [`remove_snapshot`](TimelineState::remove_snapshot) update map and
//!   sequence together
//! - [`insert_link`](TimelineState::insert_link),
//!   [`remove_link`](TimelineState::remove_link) and
//!   [`retarget_link`](TimelineState::retarget_link) update the link and its
//!   target's `links` set together

use crate::config::TimelineConfig;
use crate::error::{Result, TimelineError};
use crate::types::{Link, Snapshot};
use crate::utils::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, trace};

/// Metadata schema version written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Complete state of one timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineState {
    /// Schema version of the persisted blob
    pub format_version: u32,
    /// Identity and settings
    pub config: TimelineConfig,
    /// Tracked snapshots by id
    #[serde(default)]
    pub snapshots: BTreeMap<String, Snapshot>,
    /// Snapshot ids, oldest first
    #[serde(default)]
    pub sequence: Vec<String>,
    /// Links by name
    #[serde(default)]
    pub links: BTreeMap<String, Link>,
    /// User who froze the timeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen: Option<String>,
}

impl TimelineState {
    /// Empty state for a new timeline
    pub fn new(config: TimelineConfig) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            config,
            snapshots: BTreeMap::new(),
            sequence: Vec::new(),
            links: BTreeMap::new(),
            frozen: None,
        }
    }

    /// Load and structurally validate a metadata file
    ///
    /// # Errors
    ///
    /// - [`TimelineError::Io`] if the file cannot be read
    /// - [`TimelineError::Json`] if it is not valid metadata JSON
    /// - [`TimelineError::CorruptState`] if it was written by a newer schema
    ///   or its snapshot/link cross-references do not match
    pub fn load(path: &Path) -> Result<Self> {
        debug!("loading timeline state from {:?}", path);
        let content = fs::read_to_string(path)?;
        let state: TimelineState = serde_json::from_str(&content)?;

        if state.format_version > FORMAT_VERSION {
            return Err(TimelineError::corrupt(format!(
                "metadata format version {} is newer than supported version {}",
                state.format_version, FORMAT_VERSION
            )));
        }

        state.validate()?;
        Ok(state)
    }

    /// Persist the whole state atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())?;
        debug!("timeline state saved to {:?}", path);
        Ok(())
    }

    /// Check the cross-entity invariants
    ///
    /// - the sequence has no duplicates and lists exactly the snapshot map
    /// - every link targets a tracked snapshot that lists it back
    /// - every back-reference names an existing link that targets it
    pub fn validate(&self) -> Result<()> {
        let unique: BTreeSet<&String> = self.sequence.iter().collect();
        if unique.len() != self.sequence.len() {
            return Err(TimelineError::corrupt("snapshot sequence contains duplicates"));
        }
        if unique.len() != self.snapshots.len() || !self.snapshots.keys().all(|id| unique.contains(id)) {
            return Err(TimelineError::corrupt(
                "snapshot sequence does not match the snapshot map",
            ));
        }

        for (id, snapshot) in &self.snapshots {
            if &snapshot.id != id {
                return Err(TimelineError::corrupt(format!(
                    "snapshot stored under [{}] has id [{}]",
                    id, snapshot.id
                )));
            }
            for name in &snapshot.links {
                match self.links.get(name) {
                    Some(link) if &link.snapshot == id => {}
                    _ => {
                        return Err(TimelineError::corrupt(format!(
                            "snapshot [{}] lists link [{}] which does not point at it",
                            id, name
                        )))
                    }
                }
            }
        }

        for (name, link) in &self.links {
            if &link.name != name {
                return Err(TimelineError::corrupt(format!(
                    "link stored under [{}] has name [{}]",
                    name, link.name
                )));
            }
            match self.snapshots.get(&link.snapshot) {
                Some(snapshot) if snapshot.links.contains(name) => {}
                Some(_) => {
                    return Err(TimelineError::corrupt(format!(
                        "link [{}] is missing from the back-references of snapshot [{}]",
                        name, link.snapshot
                    )))
                }
                None => {
                    return Err(TimelineError::corrupt(format!(
                        "link [{}] points at unknown snapshot [{}]",
                        name, link.snapshot
                    )))
                }
            }
        }

        Ok(())
    }

    /// Newest snapshot id
    pub fn latest(&self) -> Option<&str> {
        self.sequence.last().map(String::as_str)
    }

    /// Append a snapshot to the map and the sequence
    pub fn insert_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        if self.snapshots.contains_key(&snapshot.id) {
            return Err(TimelineError::DuplicateSnapshot(snapshot.id));
        }
        trace!("inserting snapshot [{}]", snapshot.id);
        self.sequence.push(snapshot.id.clone());
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    /// Remove a snapshot from the map and the sequence
    ///
    /// The snapshot must no longer be referenced by any link.
    pub fn remove_snapshot(&mut self, id: &str) -> Result<Snapshot> {
        let snapshot = self
            .snapshots
            .get(id)
            .ok_or_else(|| TimelineError::UnknownSnapshot(id.to_string()))?;
        if let Some(name) = snapshot.links.iter().next() {
            return Err(TimelineError::corrupt(format!(
                "snapshot [{}] is still referenced by link [{}]",
                id, name
            )));
        }

        trace!("removing snapshot [{}]", id);
        self.sequence.retain(|s| s != id);
        self.snapshots
            .remove(id)
            .ok_or_else(|| TimelineError::UnknownSnapshot(id.to_string()))
    }

    /// Add a link and register it on its target snapshot
    pub fn insert_link(&mut self, link: Link) -> Result<()> {
        if self.links.contains_key(&link.name) {
            return Err(TimelineError::DuplicateLink(link.name));
        }
        let target = self
            .snapshots
            .get_mut(&link.snapshot)
            .ok_or_else(|| TimelineError::UnknownSnapshot(link.snapshot.clone()))?;

        trace!("inserting link [{}] -> [{}]", link.name, link.snapshot);
        target.links.insert(link.name.clone());
        self.links.insert(link.name.clone(), link);
        Ok(())
    }

    /// Remove a link and its back-reference
    pub fn remove_link(&mut self, name: &str) -> Result<Link> {
        let link = self
            .links
            .remove(name)
            .ok_or_else(|| TimelineError::UnknownLink(name.to_string()))?;
        if let Some(target) = self.snapshots.get_mut(&link.snapshot) {
            target.links.remove(name);
        }
        trace!("removed link [{}]", name);
        Ok(link)
    }

    /// Point a link at another snapshot, moving the back-reference
    ///
    /// Returns the previous target id.
    pub fn retarget_link(&mut self, name: &str, id: &str) -> Result<String> {
        if !self.snapshots.contains_key(id) {
            return Err(TimelineError::UnknownSnapshot(id.to_string()));
        }
        let link = self
            .links
            .get_mut(name)
            .ok_or_else(|| TimelineError::UnknownLink(name.to_string()))?;

        let previous = std::mem::replace(&mut link.snapshot, id.to_string());
        if let Some(old) = self.snapshots.get_mut(&previous) {
            old.links.remove(name);
        }
        if let Some(new) = self.snapshots.get_mut(id) {
            new.links.insert(name.to_string());
        }

        trace!("retargeted link [{}] from [{}] to [{}]", name, previous, id);
        Ok(previous)
    }
}
