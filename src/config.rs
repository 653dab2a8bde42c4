//! Timeline configuration
//!
//! Two representations live here:
//!
//! - [`TimelineConfig`]: identity (name, source, destination) plus the
//!   retention and copy settings, persisted inside the metadata blob.
//! - [`TimelineSettings`]: the operator-editable subset, persisted as
//!   `timeline.toml` next to the metadata. Values from this file win over
//!   the ones in the blob when a timeline is opened.
//!
//! ## Settings file
//!
//! ```toml
//! max_snapshots = 90
//! diff_log_path = "/var/log/mrepo"
//!
//! [advanced]
//! excludes = ["testing", "i386/builds"]
//! copy_dirs_recursive = ["repodata"]
//! copy_files_recursive = []
//! ```

use crate::error::{Result, TimelineError};
use crate::utils::{atomic_write, lexical_normalize};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// File name of the persisted metadata inside the destination directory
pub const METADATA_FILE: &str = ".timeline";

/// File name of the operator-editable settings inside the destination directory
pub const SETTINGS_FILE: &str = "timeline.toml";

/// Default retention limit
pub const DEFAULT_MAX_SNAPSHOTS: usize = 90;

/// Accepted retention limits
pub const MAX_SNAPSHOTS_RANGE: RangeInclusive<usize> = 3..=365;

const SETTINGS_HEADER: &str = "\
# =============================================================================
# mrepo timeline settings
#
# This file is rewritten whenever the timeline is saved; comments added here
# are not preserved.
#
# max_snapshots:   number of snapshots to keep (3-365)
# diff_log_path:   directory for snapshot diff reports (omit to disable)
#
# [advanced] do not touch unless you know what you are doing
# excludes:             paths relative to the source that are not snapshotted,
#                       e.g. [\"testing\", \"i386/builds\"]
# copy_dirs_recursive:  directory names that are copied instead of hard-linked
# copy_files_recursive: file names that are copied instead of hard-linked
#   both copy options match names anywhere in the tree (find -name patterns)
# =============================================================================

";

fn default_max_snapshots() -> usize {
    DEFAULT_MAX_SNAPSHOTS
}

/// Identity and settings of one timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Timeline name
    pub name: String,
    /// Directory snapshots are taken from (absolute, normalized)
    pub source: PathBuf,
    /// Directory snapshots and links are written into (absolute, normalized)
    pub destination: PathBuf,
    /// Retention limit
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Paths relative to `source` that are left out of snapshots
    #[serde(default)]
    pub excludes: Vec<PathBuf>,
    /// Directory for diff reports; disabled when `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_log_path: Option<PathBuf>,
    /// Directory name patterns that are fully copied instead of hard-linked
    #[serde(default)]
    pub copy_dirs_recursive: Vec<String>,
    /// File name patterns that are fully copied instead of hard-linked
    #[serde(default)]
    pub copy_files_recursive: Vec<String>,
}

impl TimelineConfig {
    /// Configuration with default settings and copy patterns detected from
    /// the source layout
    ///
    /// `source` and `destination` are expected to be normalized already.
    pub fn new(name: impl Into<String>, source: PathBuf, destination: PathBuf) -> Self {
        let kind = RepositoryKind::detect(&source);
        debug!("detected {:?} repository layout in {:?}", kind, source);

        Self {
            name: name.into(),
            source,
            destination,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            excludes: Vec::new(),
            diff_log_path: None,
            copy_dirs_recursive: kind.copy_dirs_recursive(),
            copy_files_recursive: kind.copy_files_recursive(),
        }
    }

    /// Path of the metadata file
    pub fn metadata_path(&self) -> PathBuf {
        self.destination.join(METADATA_FILE)
    }

    /// Path of the settings file
    pub fn settings_path(&self) -> PathBuf {
        self.destination.join(SETTINGS_FILE)
    }

    /// Directory of a snapshot (tracked or named)
    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.destination.join(id)
    }

    /// Path of a link's symbolic link
    pub fn link_path(&self, name: &str) -> PathBuf {
        self.destination.join(name)
    }

    /// Set the retention limit
    ///
    /// # Errors
    ///
    /// [`TimelineError::InvalidConfig`] when outside [`MAX_SNAPSHOTS_RANGE`].
    pub fn set_max_snapshots(&mut self, max_snapshots: usize) -> Result<()> {
        self.max_snapshots = validate_max_snapshots(max_snapshots)?;
        Ok(())
    }

    /// Replace the exclude list after validating every entry against `source`
    pub fn set_excludes<P: AsRef<Path>>(&mut self, excludes: &[P]) -> Result<()> {
        self.excludes = validate_excludes(&self.source, excludes)?;
        Ok(())
    }

    /// Colon-separated exclude list, as accepted by [`parse_excludes`]
    pub fn excludes_string(&self) -> String {
        self.excludes
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Apply values from the settings file through the validating setters
    pub fn apply_settings(&mut self, settings: &TimelineSettings) -> Result<()> {
        self.set_max_snapshots(settings.max_snapshots)?;
        self.set_excludes(&settings.advanced.excludes)?;
        self.diff_log_path = settings.diff_log_path.clone().filter(|p| !p.as_os_str().is_empty());
        self.copy_dirs_recursive = clean_patterns(&settings.advanced.copy_dirs_recursive);
        self.copy_files_recursive = clean_patterns(&settings.advanced.copy_files_recursive);
        Ok(())
    }

    /// Settings file view of this configuration
    pub fn settings(&self) -> TimelineSettings {
        TimelineSettings {
            max_snapshots: self.max_snapshots,
            diff_log_path: self.diff_log_path.clone(),
            advanced: AdvancedSettings {
                excludes: self
                    .excludes
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
                copy_dirs_recursive: self.copy_dirs_recursive.clone(),
                copy_files_recursive: self.copy_files_recursive.clone(),
            },
        }
    }
}

/// Operator-editable settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSettings {
    /// Retention limit
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Directory for diff reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_log_path: Option<PathBuf>,
    /// Settings that change how snapshots are materialized
    #[serde(default)]
    pub advanced: AdvancedSettings,
}

/// `[advanced]` table of the settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedSettings {
    /// See [`TimelineConfig::excludes`]
    #[serde(default)]
    pub excludes: Vec<String>,
    /// See [`TimelineConfig::copy_dirs_recursive`]
    #[serde(default)]
    pub copy_dirs_recursive: Vec<String>,
    /// See [`TimelineConfig::copy_files_recursive`]
    #[serde(default)]
    pub copy_files_recursive: Vec<String>,
}

impl TimelineSettings {
    /// Read and parse a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write the settings file atomically, with the explanatory header
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = String::from(SETTINGS_HEADER);
        content.push_str(&toml::to_string_pretty(self)?);
        atomic_write(path, content.as_bytes())
    }
}

/// Source repository layout, used to pick default copy patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    /// RPM repository (`repodata/`)
    Redhat,
    /// Debian-style repository with a `dists/` directory
    Debian,
    /// Debian-style repository that also carries an `ubuntu/` directory
    Ubuntu,
}

impl RepositoryKind {
    /// Inspect the source layout
    pub fn detect(source: &Path) -> Self {
        if source.join("dists").exists() {
            if source.join("ubuntu").exists() {
                RepositoryKind::Ubuntu
            } else {
                RepositoryKind::Debian
            }
        } else {
            RepositoryKind::Redhat
        }
    }

    /// Default directory patterns copied instead of hard-linked
    pub fn copy_dirs_recursive(self) -> Vec<String> {
        match self {
            // repoview left out due to size
            RepositoryKind::Redhat => vec!["repodata".to_string()],
            // i18n left out due to size
            RepositoryKind::Debian | RepositoryKind::Ubuntu => {
                vec!["binary-*".to_string(), "source".to_string()]
            }
        }
    }

    /// Default file patterns copied instead of hard-linked
    pub fn copy_files_recursive(self) -> Vec<String> {
        match self {
            RepositoryKind::Redhat => Vec::new(),
            RepositoryKind::Debian | RepositoryKind::Ubuntu => [
                "Release",
                "Release.gpg",
                "InRelease",
                "Contents-*.gz",
                "Index",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Check a retention limit against [`MAX_SNAPSHOTS_RANGE`]
pub fn validate_max_snapshots(max_snapshots: usize) -> Result<usize> {
    if MAX_SNAPSHOTS_RANGE.contains(&max_snapshots) {
        Ok(max_snapshots)
    } else {
        Err(TimelineError::config(format!(
            "max_snapshots must be in range {}-{}, got {}",
            MAX_SNAPSHOTS_RANGE.start(),
            MAX_SNAPSHOTS_RANGE.end(),
            max_snapshots
        )))
    }
}

/// Split a colon-separated exclude list
///
/// Entries are trimmed and empty entries dropped, so `""` clears the list.
pub fn parse_excludes(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Normalize excludes and check that each one is a relative path inside
/// `source` that currently exists
pub fn validate_excludes<P: AsRef<Path>>(source: &Path, excludes: &[P]) -> Result<Vec<PathBuf>> {
    let mut cleaned = Vec::with_capacity(excludes.len());

    for exclude in excludes {
        let normalized = lexical_normalize(exclude.as_ref());

        let escapes = normalized.is_absolute()
            || normalized.components().next() == Some(Component::ParentDir)
            || normalized == Path::new(".")
            || normalized == Path::new("*");
        if escapes {
            return Err(TimelineError::config(format!(
                "excludes must only contain relative paths inside the source, got {:?}",
                exclude.as_ref()
            )));
        }

        let exclude_path = source.join(&normalized);
        if fs::symlink_metadata(&exclude_path).is_err() {
            return Err(TimelineError::config(format!(
                "invalid exclude path {:?}",
                exclude_path
            )));
        }

        if !cleaned.contains(&normalized) {
            cleaned.push(normalized);
        }
    }

    Ok(cleaned)
}

fn clean_patterns(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
