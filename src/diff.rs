//! Snapshot diff reports
//!
//! When a diff log directory is configured, every new snapshot is compared
//! with its predecessor and a quiet recursive report (in the style of
//! `diff -r -q`) is written next to the other reports of the timeline:
//!
//! ```text
//! Only in /srv/t/2015.02.13-020000/Packages: new.rpm
//! Files /srv/t/2015.02.13-020000/Packages/a.rpm and /srv/t/2015.02.12-020000/Packages/a.rpm differ
//! ```
//!
//! Hard-linked files (the common case between two snapshots) are equal
//! without reading them. Entries whose name matches one of the timeline's
//! copy patterns are skipped: they are full copies in every snapshot and
//! would otherwise be listed as changed on every run.

use crate::error::Result;
use crate::materializer::name_patterns;
use crate::utils::atomic_write;
use globset::GlobSet;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// File extension of diff reports
pub const DIFF_LOG_EXTENSION: &str = ".diff.log";

const COMPARE_BUFFER_SIZE: usize = 64 * 1024;

/// One line of a diff report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    /// Entry present in only one of the trees
    OnlyIn {
        /// Directory containing the entry
        dir: PathBuf,
        /// Entry name
        name: String,
    },
    /// Regular files (or symlinks) with different content
    Differ {
        /// Path in the newer tree
        left: PathBuf,
        /// Path in the older tree
        right: PathBuf,
    },
    /// Same name, different entry types
    KindMismatch {
        /// Path in the newer tree
        left: PathBuf,
        /// Entry type in the newer tree
        left_kind: &'static str,
        /// Path in the older tree
        right: PathBuf,
        /// Entry type in the older tree
        right_kind: &'static str,
    },
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffEntry::OnlyIn { dir, name } => write!(f, "Only in {}: {}", dir.display(), name),
            DiffEntry::Differ { left, right } => {
                write!(f, "Files {} and {} differ", left.display(), right.display())
            }
            DiffEntry::KindMismatch {
                left,
                left_kind,
                right,
                right_kind,
            } => write!(
                f,
                "File {} is a {} while file {} is a {}",
                left.display(),
                left_kind,
                right.display(),
                right_kind
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
    Symlink,
    Special,
}

impl EntryKind {
    fn describe(self) -> &'static str {
        match self {
            EntryKind::Directory => "directory",
            EntryKind::File => "regular file",
            EntryKind::Symlink => "symbolic link",
            EntryKind::Special => "special file",
        }
    }
}

/// Compares two snapshot trees
#[derive(Debug, Clone)]
pub struct DiffReporter {
    ignore: GlobSet,
}

impl DiffReporter {
    /// Reporter skipping entries whose name matches any of `ignore_patterns`
    pub fn new(ignore_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            ignore: name_patterns(ignore_patterns)?,
        })
    }

    /// Report file for the comparison `current` → `previous` of `timeline`
    pub fn report_path(dir: &Path, timeline: &str, current: &str, previous: &str) -> PathBuf {
        dir.join(format!("{}__{}__{}{}", timeline, current, previous, DIFF_LOG_EXTENSION))
    }

    /// Compare two trees recursively
    pub fn compare(&self, left: &Path, right: &Path) -> Result<Vec<DiffEntry>> {
        let mut entries = Vec::new();
        self.compare_dirs(left, right, &mut entries)?;
        Ok(entries)
    }

    /// Compare two trees and write the report to `report`
    ///
    /// The parent directory is created when missing. Returns the number of
    /// reported differences.
    pub fn write_report(&self, left: &Path, right: &Path, report: &Path) -> Result<usize> {
        let entries = self.compare(left, right)?;

        if let Some(parent) = report.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut content = String::new();
        for entry in &entries {
            content.push_str(&entry.to_string());
            content.push('\n');
        }
        atomic_write(report, content.as_bytes())?;

        debug!("wrote {} differences to {:?}", entries.len(), report);
        Ok(entries.len())
    }

    fn compare_dirs(&self, left: &Path, right: &Path, out: &mut Vec<DiffEntry>) -> Result<()> {
        let left_entries = self.list(left)?;
        let mut right_entries = self.list(right)?;

        for (name, left_kind) in left_entries {
            let left_path = left.join(&name);
            let Some(right_kind) = right_entries.remove(&name) else {
                out.push(DiffEntry::OnlyIn {
                    dir: left.to_path_buf(),
                    name: name.to_string_lossy().into_owned(),
                });
                continue;
            };
            let right_path = right.join(&name);

            match (left_kind, right_kind) {
                (EntryKind::Directory, EntryKind::Directory) => {
                    self.compare_dirs(&left_path, &right_path, out)?;
                }
                (EntryKind::File, EntryKind::File) => {
                    if !same_content(&left_path, &right_path)? {
                        out.push(DiffEntry::Differ {
                            left: left_path,
                            right: right_path,
                        });
                    }
                }
                (EntryKind::Symlink, EntryKind::Symlink) => {
                    if fs::read_link(&left_path)? != fs::read_link(&right_path)? {
                        out.push(DiffEntry::Differ {
                            left: left_path,
                            right: right_path,
                        });
                    }
                }
                (EntryKind::Special, EntryKind::Special) => {}
                (left_kind, right_kind) => out.push(DiffEntry::KindMismatch {
                    left: left_path,
                    left_kind: left_kind.describe(),
                    right: right_path,
                    right_kind: right_kind.describe(),
                }),
            }
        }

        // Whatever is left only exists in the older tree
        for name in right_entries.into_keys() {
            out.push(DiffEntry::OnlyIn {
                dir: right.to_path_buf(),
                name: name.to_string_lossy().into_owned(),
            });
        }

        Ok(())
    }

    /// Direct children of `dir`, sorted by name, ignored names left out
    fn list(&self, dir: &Path) -> Result<BTreeMap<OsString, EntryKind>> {
        let mut entries = BTreeMap::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = entry?;
            if self.ignore.is_match(entry.file_name()) {
                continue;
            }

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Special
            };
            entries.insert(entry.file_name().to_os_string(), kind);
        }

        Ok(entries)
    }
}

/// Content equality of two regular files
fn same_content(left: &Path, right: &Path) -> Result<bool> {
    let left_meta = fs::metadata(left)?;
    let right_meta = fs::metadata(right)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if left_meta.dev() == right_meta.dev() && left_meta.ino() == right_meta.ino() {
            return Ok(true);
        }
    }

    if left_meta.len() != right_meta.len() {
        return Ok(false);
    }

    let mut left_reader = BufReader::with_capacity(COMPARE_BUFFER_SIZE, File::open(left)?);
    let mut right_reader = BufReader::with_capacity(COMPARE_BUFFER_SIZE, File::open(right)?);

    loop {
        let consumed = {
            let left_buf = left_reader.fill_buf()?;
            let right_buf = right_reader.fill_buf()?;

            if left_buf.is_empty() && right_buf.is_empty() {
                return Ok(true);
            }
            let n = left_buf.len().min(right_buf.len());
            if n == 0 || left_buf[..n] != right_buf[..n] {
                return Ok(false);
            }
            n
        };
        left_reader.consume(consumed);
        right_reader.consume(consumed);
    }
}
