//! Filesystem side of a timeline
//!
//! The [`Timeline`](crate::Timeline) decides *what* has to happen on disk and
//! persists that intent first; a [`Materializer`] carries it out. Every
//! operation either succeeds completely or returns
//! [`TimelineError::Materialization`]; partial failures are never silent.
//!
//! [`FsMaterializer`] is the implementation used in production:
//!
//! - snapshots are hard-link clones of the source (`cp -al` semantics), with
//!   excluded paths pruned during the walk
//! - directories and files whose *name* matches a copy pattern are then
//!   replaced by full copies, so repository metadata that is rewritten in
//!   place upstream never changes inside an existing snapshot
//! - links are relative symbolic links whose target is the bare snapshot id

use crate::error::{Result, TimelineError};
use crate::utils::{create_symlink, path_exists_no_follow};
use filetime::FileTime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Filesystem operations needed by a timeline
pub trait Materializer {
    /// Create `dest` as a hard-link clone of `source`, leaving out the
    /// `excludes` (paths relative to `source`)
    ///
    /// Fails if `dest` already exists.
    fn clone_with_hardlinks(&self, source: &Path, dest: &Path, excludes: &[PathBuf]) -> Result<()>;

    /// Replace directories and files in `dest` whose name matches one of
    /// the patterns by full copies of their counterparts in `source`
    fn replace_subpaths(
        &self,
        dest: &Path,
        source: &Path,
        dir_patterns: &[String],
        file_patterns: &[String],
    ) -> Result<()>;

    /// Remove a file, symlink or directory tree; a missing path is not an error
    fn remove_tree(&self, path: &Path) -> Result<()>;

    /// Create a symbolic link at `link_path` pointing at `target_id`
    ///
    /// Fails if `link_path` already exists.
    fn create_symlink(&self, target_id: &str, link_path: &Path) -> Result<()>;

    /// Atomically point the symbolic link at `link_path` to `target_id`
    fn replace_symlink(&self, target_id: &str, link_path: &Path) -> Result<()>;

    /// Remove the symbolic link at `link_path`; a missing link is not an error
    ///
    /// Anything other than a symbolic link is left in place and reported as
    /// a failure.
    fn remove_symlink(&self, link_path: &Path) -> Result<()>;
}

/// [`Materializer`] working on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsMaterializer;

impl FsMaterializer {
    /// Create a new filesystem materializer
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileMode {
    HardLink,
    Copy,
}

impl Materializer for FsMaterializer {
    fn clone_with_hardlinks(&self, source: &Path, dest: &Path, excludes: &[PathBuf]) -> Result<()> {
        for exclude in excludes {
            if !path_exists_no_follow(&source.join(exclude)) {
                warn!("trying to exclude nonexistent object {:?}", source.join(exclude));
            }
        }

        debug!("hard-linking {:?} into {:?}", source, dest);
        replicate("clone_with_hardlinks", source, dest, excludes, FileMode::HardLink)
    }

    fn replace_subpaths(
        &self,
        dest: &Path,
        source: &Path,
        dir_patterns: &[String],
        file_patterns: &[String],
    ) -> Result<()> {
        const OP: &str = "replace_subpaths";

        if !dir_patterns.is_empty() {
            let matcher = name_patterns(dir_patterns)?;
            for found in find_by_name(OP, dest, &matcher, true)? {
                let relative = relative_to(OP, &found, dest)?;
                let original = source.join(&relative);
                debug!("copying directory {:?} to {:?}", original, found);
                self.remove_tree(&found)?;
                replicate(OP, &original, &found, &[], FileMode::Copy)?;
            }
        }

        if !file_patterns.is_empty() {
            let matcher = name_patterns(file_patterns)?;
            for found in find_by_name(OP, dest, &matcher, false)? {
                let relative = relative_to(OP, &found, dest)?;
                let original = source.join(&relative);
                debug!("copying file {:?} to {:?}", original, found);
                fs::remove_file(&found).map_err(wrap(OP, &found))?;
                copy_file(OP, &original, &found)?;
            }
        }

        Ok(())
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        const OP: &str = "remove_tree";

        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(TimelineError::materialization(OP, path, e)),
        };

        trace!("removing {:?}", path);
        if metadata.is_dir() {
            fs::remove_dir_all(path).map_err(wrap(OP, path))
        } else {
            fs::remove_file(path).map_err(wrap(OP, path))
        }
    }

    fn create_symlink(&self, target_id: &str, link_path: &Path) -> Result<()> {
        trace!("linking {:?} -> {}", link_path, target_id);
        create_symlink(Path::new(target_id), link_path).map_err(wrap("create_symlink", link_path))
    }

    fn replace_symlink(&self, target_id: &str, link_path: &Path) -> Result<()> {
        const OP: &str = "replace_symlink";

        let file_name = link_path.file_name().ok_or_else(|| {
            TimelineError::materialization(
                OP,
                link_path,
                io::Error::new(io::ErrorKind::InvalidInput, "link path has no file name"),
            )
        })?;
        let temp = link_path.with_file_name(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            std::process::id()
        ));

        // Leftover from an interrupted run
        if path_exists_no_follow(&temp) {
            fs::remove_file(&temp).map_err(wrap(OP, &temp))?;
        }

        trace!("relinking {:?} -> {}", link_path, target_id);
        create_symlink(Path::new(target_id), &temp).map_err(wrap(OP, &temp))?;
        if let Err(e) = fs::rename(&temp, link_path) {
            let _ = fs::remove_file(&temp);
            return Err(TimelineError::materialization(OP, link_path, e));
        }
        Ok(())
    }

    fn remove_symlink(&self, link_path: &Path) -> Result<()> {
        const OP: &str = "remove_symlink";

        match fs::symlink_metadata(link_path) {
            Ok(metadata) if metadata.file_type().is_symlink() => {}
            Ok(_) => {
                return Err(TimelineError::materialization(
                    OP,
                    link_path,
                    io::Error::other("refusing to remove an entry that is not a symbolic link"),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(TimelineError::materialization(OP, link_path, e)),
        }

        match fs::remove_file(link_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TimelineError::materialization(OP, link_path, e)),
        }
    }
}

/// Compile find `-name` style patterns into a matcher for single names
pub(crate) fn name_patterns(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn wrap<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> TimelineError + 'a {
    move |source| TimelineError::materialization(op, path, source)
}

fn walk_error(op: &'static str, root: &Path, err: walkdir::Error) -> TimelineError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("filesystem loop detected"));
    TimelineError::materialization(op, path, source)
}

fn relative_to(op: &'static str, path: &Path, root: &Path) -> Result<PathBuf> {
    path.strip_prefix(root).map(Path::to_path_buf).map_err(|_| {
        TimelineError::materialization(
            op,
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path escapes the walked tree"),
        )
    })
}

/// Recreate `source` at `dest`, hard-linking or copying regular files
///
/// Symlinks are recreated verbatim and never followed. Directory
/// permissions and mtimes are applied after the walk, deepest first, so
/// read-only directories and freshly created children do not interfere.
fn replicate(op: &'static str, source: &Path, dest: &Path, excludes: &[PathBuf], mode: FileMode) -> Result<()> {
    fs::create_dir(dest).map_err(wrap(op, dest))?;

    let mut directories: Vec<(PathBuf, fs::Permissions, FileTime)> = Vec::new();
    if mode == FileMode::Copy {
        let metadata = fs::metadata(source).map_err(wrap(op, source))?;
        directories.push((
            dest.to_path_buf(),
            metadata.permissions(),
            FileTime::from_last_modification_time(&metadata),
        ));
    }

    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(source) {
            Ok(relative) => {
                let excluded = excludes.iter().any(|e| e.as_path() == relative);
                if excluded {
                    debug!("excluding (skipping) object {:?}", entry.path());
                }
                !excluded
            }
            Err(_) => true,
        });

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(op, source, e))?;
        let relative = relative_to(op, entry.path(), source)?;
        let target = dest.join(&relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(wrap(op, &target))?;
            let metadata = entry.metadata().map_err(|e| walk_error(op, source, e))?;
            directories.push((
                target,
                metadata.permissions(),
                FileTime::from_last_modification_time(&metadata),
            ));
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path()).map_err(wrap(op, entry.path()))?;
            create_symlink(&link_target, &target).map_err(wrap(op, &target))?;
        } else {
            match mode {
                FileMode::HardLink => fs::hard_link(entry.path(), &target).map_err(wrap(op, &target))?,
                FileMode::Copy => copy_file(op, entry.path(), &target)?,
            }
        }
    }

    for (path, permissions, mtime) in directories.into_iter().rev() {
        fs::set_permissions(&path, permissions).map_err(wrap(op, &path))?;
        filetime::set_file_mtime(&path, mtime).map_err(wrap(op, &path))?;
    }

    Ok(())
}

/// Full copy of one file, preserving permissions and mtime
fn copy_file(op: &'static str, source: &Path, dest: &Path) -> Result<()> {
    let metadata = fs::metadata(source).map_err(wrap(op, source))?;
    fs::copy(source, dest).map_err(wrap(op, dest))?;
    filetime::set_file_mtime(dest, FileTime::from_last_modification_time(&metadata))
        .map_err(wrap(op, dest))?;
    Ok(())
}

/// Directories (`dirs == true`) or regular files below `root` whose name
/// matches `matcher`
///
/// A matching directory is not descended into; it is replaced as a whole.
fn find_by_name(op: &'static str, root: &Path, matcher: &GlobSet, dirs: bool) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).follow_links(false).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| walk_error(op, root, e))?;
        let file_type = entry.file_type();
        let wanted = if dirs { file_type.is_dir() } else { file_type.is_file() };

        if wanted && matcher.is_match(entry.file_name()) {
            found.push(entry.path().to_path_buf());
            if dirs {
                walker.skip_current_dir();
            }
        }
    }

    Ok(found)
}
