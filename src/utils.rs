//! Utility functions for mrepo
//!
//! Small filesystem helpers shared by the state store, the configuration
//! layer, the materializer and the CLI:
//!
//! - Atomic file writing (temp file in the same directory, then rename)
//! - Lexical path normalization (no symlink resolution)
//! - Cross-platform symbolic link creation
//! - Splitting `REPOSITORY/ENTRY` arguments

use crate::error::Result;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Write a file atomically
///
/// The content is written to a uniquely named temporary file in the target's
/// directory, flushed to disk and then renamed over the target. Readers see
/// either the previous file or the complete new one, never a partial write.
/// The temporary file is removed if any step fails.
///
/// # Errors
///
/// - [`TimelineError::Io`](crate::TimelineError::Io) if the temporary file
///   cannot be created, written or synced
/// - [`TimelineError::Io`](crate::TimelineError::Io) if the rename fails
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::atomic_write;
/// use std::path::Path;
///
/// atomic_write(Path::new("/srv/repo/epel.timeline/.timeline"), b"{}")?;
/// ```
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Lexically normalize a path
///
/// Removes `.` components and resolves `..` against preceding normal
/// components without touching the filesystem. Leading `..` components of a
/// relative path are kept. An empty result is returned as `.`.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Make a path absolute and lexically normalized
///
/// Relative paths are resolved against the current working directory.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    Ok(lexical_normalize(&std::path::absolute(path)?))
}

/// Split `REPOSITORY/ENTRY` into the repository directory and the entry name
///
/// Returns `None` when the path has no final component (e.g. `/` or `..`).
pub fn split_entry_path(path: &Path) -> Option<(PathBuf, String)> {
    let normalized = lexical_normalize(path);
    let name = normalized.file_name()?.to_str()?.to_string();
    let parent = match normalized.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((parent, name))
}

/// Reduce a snapshot argument to its id
///
/// Snapshot arguments may be given as a bare id or as a path into the
/// timeline directory; only the last component is the id.
pub fn entry_name(value: &str) -> String {
    if value.contains('/') {
        lexical_normalize(Path::new(value))
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| value.to_string())
    } else {
        value.to_string()
    }
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Create a symlink (Windows)
///
/// Timeline links always point at snapshot directories, so a directory
/// symlink is created even when the (relative) target cannot be resolved
/// from the current directory.
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Whether `path` exists without following a final symlink
pub fn path_exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
