//! Timeline engine
//!
//! A [`Timeline`] binds a source directory to a destination directory and a
//! retention policy. It owns the persisted [`TimelineState`] and a
//! [`Materializer`] and is the only code path that mutates snapshots and
//! links.
//!
//! ## Mutation protocol
//!
//! Every mutating operation runs the same steps:
//!
//! 1. reject when frozen (except [`Timeline::create_named_snapshot`])
//! 2. validate names, targets and on-disk presence
//! 3. update the in-memory state
//! 4. persist the state (atomic write)
//! 5. ask the materializer to change the filesystem
//!
//! Errors in steps 1-2 leave everything untouched. A failure in step 5
//! leaves the metadata ahead of the filesystem;
//! [`Timeline::consistency_check`] repairs that later.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use mrepo::{LinkOptions, SnapshotOptions, Timeline};
//!
//! # fn main() -> mrepo::Result<()> {
//! let mut timeline = Timeline::create("epel", "/srv/mirror/epel", "/srv/repo/epel.timeline")?;
//! timeline.set_max_snapshots(30)?;
//!
//! let id = timeline.create_snapshot(SnapshotOptions::new())?;
//! timeline.create_link("stable", LinkOptions::new().snapshot(&id).max_offset(7))?;
//! timeline.save()?;
//! # Ok(())
//! # }
//! ```

use crate::config::{parse_excludes, TimelineConfig, TimelineSettings, METADATA_FILE, SETTINGS_FILE};
use crate::diff::DiffReporter;
use crate::error::{Result, TimelineError};
use crate::materializer::{name_patterns, FsMaterializer, Materializer};
use crate::lock::LOCK_FILE;
use crate::naming::validate_name;
use crate::policy;
use crate::state::TimelineState;
use crate::types::{ConsistencyReport, DiskCheck, Link, LinkOptions, Snapshot, SnapshotOptions};
use crate::utils::{normalize_path, path_exists_no_follow};
use chrono::{DateTime, Local, Utc};
use rand::Rng;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Span};

/// Snapshot id format
const SNAPSHOT_ID_FORMAT: &str = "%Y.%m.%d-%H%M%S";

/// Snapshot id format with microseconds, for rapid successive snapshots
const DEBUG_SNAPSHOT_ID_FORMAT: &str = "%Y.%m.%d-%H%M%S%.6f";

/// Offsets of the `offsetNNN` default links
pub const DEFAULT_LINK_OFFSETS: [usize; 7] = [3, 7, 14, 21, 30, 60, 90];

/// On-disk effect of a link cascade
enum LinkChange {
    Retargeted { path: PathBuf, target: String },
    Removed { path: PathBuf },
}

/// One managed timeline
pub struct Timeline {
    state: TimelineState,
    materializer: Box<dyn Materializer>,
    debug_ids: bool,
    span: Span,
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("config", &self.state.config)
            .field("snapshots", &self.state.sequence)
            .field("links", &self.state.links.keys().collect::<Vec<_>>())
            .field("frozen", &self.state.frozen)
            .field("debug_ids", &self.debug_ids)
            .finish()
    }
}

impl fmt::Display for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[name={}, source={}, destination={}, max_snapshots={}, excludes={}]",
            self.name(),
            self.source().display(),
            self.destination().display(),
            self.max_snapshots(),
            self.state.config.excludes_string()
        )
    }
}

impl Timeline {
    /// Create a timeline, or re-open it if `destination` already holds one
    ///
    /// The source must be an existing directory; the destination is created
    /// when missing. When metadata already exists in the destination, its
    /// name, source and destination must match the arguments.
    ///
    /// # Errors
    ///
    /// - [`TimelineError::InvalidName`] for an invalid timeline name
    /// - [`TimelineError::InvalidConfig`] if the source is not a directory or
    ///   the settings file holds invalid values
    /// - [`TimelineError::CorruptState`] if existing metadata does not match
    pub fn create(name: &str, source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<Self> {
        TimelineBuilder::new().create(name, source, destination)
    }

    /// Open the timeline stored in `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        TimelineBuilder::new().open(path)
    }

    /// Builder for timelines with a custom materializer or debug ids
    pub fn builder() -> TimelineBuilder {
        TimelineBuilder::new()
    }

    fn construct(
        name: &str,
        source: &Path,
        destination: &Path,
        stored: Option<TimelineState>,
        materializer: Box<dyn Materializer>,
        debug_ids: bool,
    ) -> Result<Self> {
        validate_name("timeline", name)?;

        let source = normalize_path(source)?;
        if !source.is_dir() {
            return Err(TimelineError::config(format!(
                "source {:?} is not a valid directory",
                source
            )));
        }
        let destination = normalize_path(destination)?;
        fs::create_dir_all(&destination)?;

        let span = info_span!("timeline", name = %name);
        let _entered = span.clone().entered();
        info!(
            "configuring timeline from source {:?} into destination {:?}",
            source, destination
        );

        let config = TimelineConfig::new(name, source, destination);
        let metadata_path = config.metadata_path();

        let stored = match stored {
            None if metadata_path.exists() => Some(TimelineState::load(&metadata_path)?),
            stored => stored,
        };
        let mut state = if let Some(state) = stored {
            if state.config.name != config.name
                || state.config.source != config.source
                || state.config.destination != config.destination
            {
                return Err(TimelineError::corrupt(format!(
                    "metadata in {:?} belongs to timeline [{}] ({:?} -> {:?})",
                    metadata_path, state.config.name, state.config.source, state.config.destination
                )));
            }
            info!("loaded {} snapshots and {} links", state.sequence.len(), state.links.len());
            state
        } else {
            TimelineState::new(config)
        };

        let settings_path = state.config.settings_path();
        if settings_path.exists() {
            let settings = TimelineSettings::load(&settings_path)?;
            state.config.apply_settings(&settings)?;
            debug!("applied settings from {:?}", settings_path);
        } else {
            state.config.settings().save(&settings_path)?;
            debug!("wrote default settings to {:?}", settings_path);
        }

        drop(_entered);
        Ok(Self {
            state,
            materializer,
            debug_ids,
            span,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Timeline name
    pub fn name(&self) -> &str {
        &self.state.config.name
    }

    /// Source directory
    pub fn source(&self) -> &Path {
        &self.state.config.source
    }

    /// Destination directory
    pub fn destination(&self) -> &Path {
        &self.state.config.destination
    }

    /// Identity and settings
    pub fn config(&self) -> &TimelineConfig {
        &self.state.config
    }

    /// Complete persisted state
    pub fn state(&self) -> &TimelineState {
        &self.state
    }

    /// Retention limit
    pub fn max_snapshots(&self) -> usize {
        self.state.config.max_snapshots
    }

    /// Excluded paths, relative to the source
    pub fn excludes(&self) -> &[PathBuf] {
        &self.state.config.excludes
    }

    /// Diff report directory, if enabled
    pub fn diff_log_path(&self) -> Option<&Path> {
        self.state.config.diff_log_path.as_deref()
    }

    /// Snapshot ids, oldest first
    pub fn sequence(&self) -> &[String] {
        &self.state.sequence
    }

    /// Tracked snapshots, oldest first
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        self.state
            .sequence
            .iter()
            .filter_map(|id| self.state.snapshots.get(id))
    }

    /// Look up a tracked snapshot
    pub fn snapshot(&self, id: &str) -> Option<&Snapshot> {
        self.state.snapshots.get(id)
    }

    /// Newest tracked snapshot
    pub fn latest_snapshot(&self) -> Result<&Snapshot> {
        self.state
            .latest()
            .and_then(|id| self.state.snapshots.get(id))
            .ok_or(TimelineError::NoSnapshots)
    }

    /// Links, ordered by name
    pub fn links(&self) -> impl Iterator<Item = &Link> + '_ {
        self.state.links.values()
    }

    /// Look up a link
    pub fn link(&self, name: &str) -> Option<&Link> {
        self.state.links.get(name)
    }

    /// User who froze the timeline
    pub fn frozen_by(&self) -> Option<&str> {
        self.state.frozen.as_deref()
    }

    /// Whether mutations are currently rejected
    pub fn is_frozen(&self) -> bool {
        self.state.frozen.is_some()
    }

    /// Offset of a snapshot from the newest one (newest = 1)
    pub fn offset_of(&self, id: &str) -> Result<usize> {
        policy::offset_of(&self.state.sequence, id)
    }

    /// Snapshot that inherits the links of `id` when it is deleted
    pub fn neighbour_of(&self, id: &str) -> Result<&str> {
        policy::neighbour_of(&self.state.sequence, id)
    }

    /// Whether a link points beyond its pin window
    pub fn violates_max_offset(&self, link: &Link) -> Result<bool> {
        policy::violates_max_offset(&self.state.sequence, link)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Set the retention limit (3-365)
    ///
    /// Does not rotate; call [`Timeline::rotate_snapshots`] after lowering
    /// the limit.
    pub fn set_max_snapshots(&mut self, max_snapshots: usize) -> Result<()> {
        self.state.config.set_max_snapshots(max_snapshots)?;
        info!(parent: &self.span, "max_snapshots set to {}", max_snapshots);
        Ok(())
    }

    /// Replace the exclude list
    pub fn set_excludes<P: AsRef<Path>>(&mut self, excludes: &[P]) -> Result<()> {
        self.state.config.set_excludes(excludes)?;
        info!(parent: &self.span, "excludes set to [{}]", self.state.config.excludes_string());
        Ok(())
    }

    /// Replace the exclude list from a colon-separated string (`""` clears it)
    pub fn set_excludes_str(&mut self, excludes: &str) -> Result<()> {
        self.set_excludes(&parse_excludes(excludes))
    }

    /// Enable (`Some`) or disable (`None`) diff reports
    pub fn set_diff_log_path(&mut self, path: Option<&Path>) -> Result<()> {
        self.state.config.diff_log_path = match path {
            Some(path) => Some(normalize_path(path)?),
            None => None,
        };
        Ok(())
    }

    /// Replace the name patterns that are copied instead of hard-linked
    pub fn set_copy_patterns(&mut self, dirs: Vec<String>, files: Vec<String>) -> Result<()> {
        name_patterns(&dirs)?;
        name_patterns(&files)?;
        self.state.config.copy_dirs_recursive = dirs;
        self.state.config.copy_files_recursive = files;
        Ok(())
    }

    /// Persist the metadata and rewrite the settings file
    pub fn save(&self) -> Result<()> {
        let _span = self.span.clone().entered();
        info!("saving timeline state");
        self.persist()?;
        self.state.config.settings().save(&self.state.config.settings_path())
    }

    fn persist(&self) -> Result<()> {
        self.state.save(&self.state.config.metadata_path())
    }

    // ------------------------------------------------------------------
    // Freeze gate
    // ------------------------------------------------------------------

    /// Freeze the timeline; meant for emergencies
    ///
    /// Like the setters, this only changes the in-memory state; call
    /// [`Timeline::save`] to persist it.
    pub fn freeze(&mut self, user: &str) -> Result<()> {
        if let Some(holder) = &self.state.frozen {
            return Err(TimelineError::AlreadyFrozen(holder.clone()));
        }
        if user.trim().is_empty() {
            return Err(TimelineError::config("invalid user"));
        }

        self.state.frozen = Some(user.to_string());
        info!(parent: &self.span, "timeline has been frozen by user [{}]", user);
        Ok(())
    }

    /// Unfreeze the timeline, returning the previous holder
    ///
    /// `user` is only recorded in the log.
    pub fn unfreeze(&mut self, user: &str) -> Option<String> {
        let previous = self.state.frozen.take();
        match &previous {
            Some(holder) => info!(
                parent: &self.span,
                "timeline previously frozen by user [{}] has been unfrozen by [{}]", holder, user
            ),
            None => warn!(parent: &self.span, "timeline is not frozen"),
        }
        previous
    }

    fn check_frozen(&self) -> Result<()> {
        match &self.state.frozen {
            Some(holder) => Err(TimelineError::Frozen(holder.clone())),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Validity checks
    // ------------------------------------------------------------------

    fn tracked_snapshot(&self, id: &str) -> Result<&Snapshot> {
        self.state
            .snapshots
            .get(id)
            .ok_or_else(|| TimelineError::UnknownSnapshot(id.to_string()))
    }

    fn tracked_link(&self, name: &str) -> Result<&Link> {
        self.state
            .links
            .get(name)
            .ok_or_else(|| TimelineError::UnknownLink(name.to_string()))
    }

    /// Check that a snapshot is tracked and its directory exists
    ///
    /// An untracked id is always an error. A missing directory is
    /// [`TimelineError::SnapshotMissing`] in [`DiskCheck::Strict`] mode and a
    /// logged `Ok(false)` in [`DiskCheck::Lenient`] mode.
    pub fn check_snapshot(&self, id: &str, mode: DiskCheck) -> Result<bool> {
        let snapshot = self.tracked_snapshot(id)?;
        if snapshot.path.exists() {
            return Ok(true);
        }

        match mode {
            DiskCheck::Strict => Err(TimelineError::SnapshotMissing(snapshot.path.clone())),
            DiskCheck::Lenient => {
                warn!(parent: &self.span, "snapshot {:?} not found", snapshot.path);
                Ok(false)
            }
        }
    }

    /// Check that a link is tracked and its symbolic link exists and resolves
    pub fn check_link(&self, name: &str, mode: DiskCheck) -> Result<bool> {
        let link = self.tracked_link(name)?;

        let is_symlink = fs::symlink_metadata(&link.path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        let problem = if !is_symlink {
            "not found"
        } else if !link.path.exists() {
            "is broken"
        } else {
            return Ok(true);
        };

        match mode {
            DiskCheck::Strict => Err(TimelineError::LinkMissing {
                path: link.path.clone(),
                problem,
            }),
            DiskCheck::Lenient => {
                warn!(parent: &self.span, "link {:?} {}", link.path, problem);
                Ok(false)
            }
        }
    }

    /// Whether a snapshot is tracked and present on disk
    pub fn is_snapshot_valid(&self, id: &str) -> bool {
        self.state
            .snapshots
            .get(id)
            .map(|s| s.path.exists())
            .unwrap_or(false)
    }

    /// Whether a link is tracked and its symbolic link resolves
    pub fn is_link_valid(&self, name: &str) -> bool {
        self.state
            .links
            .get(name)
            .map(|l| {
                fs::symlink_metadata(&l.path)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
                    && l.path.exists()
            })
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    fn snapshot_id(&self, now: &DateTime<Local>) -> String {
        let format = if self.debug_ids {
            DEBUG_SNAPSHOT_ID_FORMAT
        } else {
            SNAPSHOT_ID_FORMAT
        };
        now.format(format).to_string()
    }

    fn latest_id(&self) -> Result<String> {
        self.state
            .latest()
            .map(str::to_string)
            .ok_or(TimelineError::NoSnapshots)
    }

    /// Take a new snapshot of the source and rotate
    ///
    /// Returns the id of the new snapshot.
    ///
    /// # Errors
    ///
    /// - [`TimelineError::Frozen`] while frozen
    /// - [`TimelineError::DuplicateSnapshot`] if a snapshot with the same id
    ///   (same second, or microsecond with debug ids) already exists
    /// - [`TimelineError::Materialization`] if cloning fails; the snapshot
    ///   is then already recorded in the metadata
    pub fn create_snapshot(&mut self, options: SnapshotOptions) -> Result<String> {
        let _span = self.span.clone().entered();
        self.check_frozen()?;

        if let Some(max) = options.random_sleep_before {
            let seconds = rand::rng().random_range(1..=max.as_secs().max(1));
            info!("sleeping [{}] seconds before taking a new snapshot", seconds);
            thread::sleep(Duration::from_secs(seconds));
        }

        let now = Local::now();
        let id = self.snapshot_id(&now);
        info!("creating new snapshot [{}]", id);

        if self.state.snapshots.contains_key(&id) {
            return Err(TimelineError::DuplicateSnapshot(id));
        }

        let path = self.state.config.snapshot_path(&id);
        self.state
            .insert_snapshot(Snapshot::new(id.clone(), now.with_timezone(&Utc), path.clone()))?;
        self.persist()?;

        self.materialize(self.source(), &path)?;
        self.generate_diff_report(&id);
        self.rotate_snapshots()?;

        debug!("created new snapshot [{}]", id);

        if let Some(duration) = options.sleep_after {
            info!("sleeping for [{}]", humantime::format_duration(duration));
            thread::sleep(duration);
        }

        Ok(id)
    }

    /// Materialize an untracked copy named `name`
    ///
    /// Copies `source_snapshot` when given, otherwise the source directory.
    /// Named snapshots are not recorded in the metadata and can be created
    /// while the timeline is frozen.
    pub fn create_named_snapshot(&self, name: &str, source_snapshot: Option<&str>) -> Result<PathBuf> {
        let _span = self.span.clone().entered();
        info!("creating named snapshot [{}]", name);

        let source = match source_snapshot {
            Some(id) => {
                info!("using source snapshot [{}]", id);
                self.check_snapshot(id, DiskCheck::Strict)?;
                self.tracked_snapshot(id)?.path.clone()
            }
            None => self.source().to_path_buf(),
        };
        validate_name("snapshot", name)?;

        let path = self.state.config.snapshot_path(name);
        self.materialize(&source, &path)?;

        debug!("created named snapshot {:?}", path);
        Ok(path)
    }

    fn materialize(&self, source: &Path, dest: &Path) -> Result<()> {
        let config = &self.state.config;
        self.materializer
            .clone_with_hardlinks(source, dest, &config.excludes)?;
        self.materializer.replace_subpaths(
            dest,
            source,
            &config.copy_dirs_recursive,
            &config.copy_files_recursive,
        )
    }

    /// Write a diff report for the newest snapshot; failures are only logged
    fn generate_diff_report(&mut self, id: &str) {
        let Some(dir) = self.state.config.diff_log_path.clone() else {
            return;
        };
        let len = self.state.sequence.len();
        if len < 2 {
            return;
        }
        let previous = self.state.sequence[len - 2].clone();
        info!("generating diff report from snapshots [{}] -> [{}]", id, previous);

        match self.write_diff_report(&dir, id, &previous) {
            Ok(report) => {
                if let Some(snapshot) = self.state.snapshots.get_mut(id) {
                    snapshot.diff_log_file = Some(report);
                }
                if let Err(e) = self.persist() {
                    warn!("failed to record diff report: {}", e);
                }
            }
            Err(e) => warn!("failed to generate diff report: {}", e),
        }
    }

    fn write_diff_report(&self, dir: &Path, current: &str, previous: &str) -> Result<PathBuf> {
        self.check_snapshot(current, DiskCheck::Strict)?;
        self.check_snapshot(previous, DiskCheck::Strict)?;

        let config = &self.state.config;
        let ignore = [config.copy_dirs_recursive.as_slice(), config.copy_files_recursive.as_slice()].concat();
        let reporter = DiffReporter::new(&ignore)?;

        let report = DiffReporter::report_path(dir, &config.name, current, previous);
        reporter.write_report(
            &config.snapshot_path(current),
            &config.snapshot_path(previous),
            &report,
        )?;
        debug!("generated diff log file {:?}", report);
        Ok(report)
    }

    /// Delete a tracked snapshot
    ///
    /// Links pointing at it move to [`Timeline::neighbour_of`]; when it is
    /// the last snapshot they are deleted as well. A snapshot directory that
    /// is already gone only logs a warning.
    pub fn delete_snapshot(&mut self, id: &str) -> Result<Snapshot> {
        let _span = self.span.clone().entered();
        info!("deleting snapshot [{}]", id);

        self.check_frozen()?;
        self.check_snapshot(id, DiskCheck::Lenient)?;

        let (snapshot, changes) = self.detach_snapshot(id)?;
        self.persist()?;

        self.apply_link_changes(&changes)?;
        self.materializer.remove_tree(&snapshot.path)?;
        if let Some(report) = &snapshot.diff_log_file {
            debug!("deleting diff log file {:?}", report);
            self.materializer.remove_tree(report)?;
        }

        debug!("deleted snapshot [{}]", id);
        Ok(snapshot)
    }

    /// Resolve the links of a snapshot and drop it from the state
    fn detach_snapshot(&mut self, id: &str) -> Result<(Snapshot, Vec<LinkChange>)> {
        let names: Vec<String> = self.tracked_snapshot(id)?.links.iter().cloned().collect();
        let mut changes = Vec::with_capacity(names.len());

        if self.state.sequence.len() == 1 {
            for name in names {
                info!("deleting link [{}] together with the last snapshot", name);
                let link = self.state.remove_link(&name)?;
                changes.push(LinkChange::Removed { path: link.path });
            }
        } else if !names.is_empty() {
            let neighbour = policy::neighbour_of(&self.state.sequence, id)?.to_string();
            for name in names {
                info!("moving link [{}] to neighbour snapshot [{}]", name, neighbour);
                self.state.retarget_link(&name, &neighbour)?;
                changes.push(LinkChange::Retargeted {
                    path: self.state.config.link_path(&name),
                    target: neighbour.clone(),
                });
            }
        }

        let snapshot = self.state.remove_snapshot(id)?;
        Ok((snapshot, changes))
    }

    fn apply_link_changes(&self, changes: &[LinkChange]) -> Result<()> {
        for change in changes {
            match change {
                LinkChange::Retargeted { path, target } => self.materializer.replace_symlink(target, path)?,
                LinkChange::Removed { path } => self.materializer.remove_symlink(path)?,
            }
        }
        Ok(())
    }

    /// Evict snapshots beyond the retention limit and re-pin links
    ///
    /// Oldest snapshots go first. Afterwards every pinned link whose target
    /// is older than its `max_offset` is moved to the snapshot exactly
    /// `max_offset` positions old. Returns the evicted snapshot ids.
    pub fn rotate_snapshots(&mut self) -> Result<Vec<String>> {
        let _span = self.span.clone().entered();

        let evict = policy::eviction_count(self.state.sequence.len(), self.max_snapshots());
        let evicted: Vec<String> = self.state.sequence[..evict].to_vec();
        for id in &evicted {
            info!("rotating out snapshot [{}]", id);
            self.delete_snapshot(id)?;
        }

        let plan: Vec<(String, String)> = policy::repin_plan(&self.state.sequence, self.state.links.values())
            .into_iter()
            .map(|(name, target)| (name, target.to_string()))
            .collect();
        for (name, target) in plan {
            self.repin_link(&name, &target)?;
        }

        Ok(evicted)
    }

    fn repin_link(&mut self, name: &str, target: &str) -> Result<()> {
        self.check_frozen()?;
        info!("link [{}] exceeds its max offset, moving it to snapshot [{}]", name, target);

        self.state.retarget_link(name, target)?;
        self.persist()?;

        let path = self.state.config.link_path(name);
        self.materializer.replace_symlink(target, &path)
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Create a link to `options.snapshot` (the newest snapshot by default)
    ///
    /// Pointing a pinned link at a snapshot that already exceeds its
    /// `max_offset` is allowed but logged; the next rotation moves it.
    pub fn create_link(&mut self, name: &str, options: LinkOptions) -> Result<Link> {
        let _span = self.span.clone().entered();

        self.check_frozen()?;
        self.check_link_name(name)?;
        let target = match options.snapshot {
            Some(id) => id,
            None => self.latest_id()?,
        };
        info!("creating new link [{}] to snapshot [{}]", name, target);

        self.check_snapshot(&target, DiskCheck::Strict)?;

        let offset = self.offset_of(&target)?;
        if options.max_offset > 0 && offset > options.max_offset {
            warn!(
                "creating link to snapshot with offset [{}] which already lies beyond max_offset [{}]",
                offset, options.max_offset
            );
        }

        let link = Link {
            name: name.to_string(),
            created_at: Utc::now(),
            snapshot: target.clone(),
            path: self.state.config.link_path(name),
            max_offset: options.max_offset,
            warn_before_max_offset: options.warn_before_max_offset,
        };
        self.state.insert_link(link.clone())?;
        self.persist()?;

        self.materializer.create_symlink(&target, &link.path)?;

        debug!("created new link [{}] to snapshot [{}]", name, target);
        Ok(link)
    }

    /// Point a link at `snapshot` (the newest snapshot by default)
    pub fn update_link(&mut self, name: &str, snapshot: Option<&str>) -> Result<()> {
        let _span = self.span.clone().entered();

        self.check_frozen()?;
        let target = match snapshot {
            Some(id) => id.to_string(),
            None => self.latest_id()?,
        };
        info!("updating link [{}] to snapshot [{}]", name, target);

        self.check_link(name, DiskCheck::Strict)?;
        self.check_snapshot(&target, DiskCheck::Strict)?;

        let link = self.tracked_link(name)?;
        if link.snapshot == target {
            warn!("link [{}] already points to snapshot [{}]", name, target);
        }
        let offset = self.offset_of(&target)?;
        if link.max_offset > 0 && offset > link.max_offset {
            warn!(
                "updating link to snapshot with offset [{}] which lies beyond specified max_offset [{}]",
                offset, link.max_offset
            );
        }
        let path = link.path.clone();

        self.state.retarget_link(name, &target)?;
        self.persist()?;

        self.materializer.replace_symlink(&target, &path)?;

        info!("updated link [{}] to snapshot [{}]", name, target);
        Ok(())
    }

    /// Delete a link, returning its former attributes
    pub fn delete_link(&mut self, name: &str) -> Result<Link> {
        let _span = self.span.clone().entered();
        info!("deleting link [{}]", name);

        self.check_frozen()?;
        self.check_link(name, DiskCheck::Lenient)?;

        let link = self.state.remove_link(name)?;
        self.persist()?;

        self.materializer.remove_symlink(&link.path)?;

        debug!("deleted link [{}]", name);
        Ok(link)
    }

    /// Rename a link, keeping its target and pinning
    ///
    /// The new name and the preserved target are validated first; the rename
    /// itself is a delete followed by a create, so only an interruption
    /// between the two can lose the link.
    pub fn rename_link(&mut self, name: &str, new_name: &str) -> Result<Link> {
        let _span = self.span.clone().entered();
        info!("renaming link [{}] to [{}]", name, new_name);

        self.check_frozen()?;
        let options = LinkOptions::from(self.tracked_link(name)?);
        self.check_link_name(new_name)?;
        if let Some(target) = &options.snapshot {
            self.check_snapshot(target, DiskCheck::Strict)?;
        }

        self.delete_link(name)?;
        self.create_link(new_name, options)
    }

    /// Check that `name` is free for a new link
    ///
    /// Links live next to the snapshots and the timeline's own files, so a
    /// name must not be a tracked link, a reserved file, a snapshot id or any
    /// other entry already present in the destination.
    fn check_link_name(&self, name: &str) -> Result<()> {
        validate_name("link", name)?;
        if self.state.links.contains_key(name) {
            return Err(TimelineError::DuplicateLink(name.to_string()));
        }

        let taken_by = if [METADATA_FILE, SETTINGS_FILE, LOCK_FILE].contains(&name) {
            Some("a timeline file".to_string())
        } else if self.state.snapshots.contains_key(name) {
            Some(format!("snapshot [{}]", name))
        } else {
            let path = self.state.config.link_path(name);
            path_exists_no_follow(&path).then(|| format!("existing entry {:?}", path))
        };

        match taken_by {
            Some(taken_by) => Err(TimelineError::LinkNameTaken {
                name: name.to_string(),
                taken_by,
            }),
            None => Ok(()),
        }
    }

    /// Create `upstream`, `downstream` and the `offsetNNN` links
    ///
    /// Offset links are only created when the retention limit can reach
    /// their offset. Existing links are skipped, so this can be re-run.
    /// Returns the names of the links that were created.
    pub fn create_default_links(&mut self) -> Result<Vec<String>> {
        let mut defaults = vec![("upstream".to_string(), 1), ("downstream".to_string(), 0)];
        defaults.extend(
            DEFAULT_LINK_OFFSETS
                .iter()
                .filter(|&&offset| self.max_snapshots() >= offset)
                .map(|&offset| (format!("offset{:03}", offset), offset)),
        );

        let mut created = Vec::new();
        for (name, max_offset) in defaults {
            if self.state.links.contains_key(&name) {
                warn!(parent: &self.span, "link [{}] already exists, skipping", name);
                continue;
            }
            self.create_link(&name, LinkOptions::new().max_offset(max_offset))?;
            created.push(name);
        }
        Ok(created)
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Drop metadata for links and snapshots that are gone from disk
    ///
    /// Links whose symbolic link is missing or broken are deleted first;
    /// then snapshots whose directory is missing are deleted, moving their
    /// links exactly like [`Timeline::delete_snapshot`]. A frozen timeline
    /// with drift fails with [`TimelineError::Frozen`] before anything is
    /// removed.
    pub fn consistency_check(&mut self) -> Result<ConsistencyReport> {
        let _span = self.span.clone().entered();
        let mut report = ConsistencyReport::default();

        info!("checking links...");
        let broken: Vec<String> = self
            .state
            .links
            .keys()
            .filter(|name| matches!(self.check_link(name, DiskCheck::Lenient), Ok(false)))
            .cloned()
            .collect();

        info!("checking snapshots...");
        let missing: Vec<String> = self
            .state
            .sequence
            .iter()
            .filter(|id| matches!(self.check_snapshot(id, DiskCheck::Lenient), Ok(false)))
            .cloned()
            .collect();

        if broken.is_empty() && missing.is_empty() {
            info!("timeline is consistent");
            return Ok(report);
        }
        self.check_frozen()?;

        for name in broken {
            warn!("deleting invalid link [{}]", name);
            self.delete_link(&name)?;
            report.removed_links.push(name);
        }
        for id in missing {
            warn!("deleting invalid snapshot [{}]", id);
            self.delete_snapshot(&id)?;
            report.removed_snapshots.push(id);
        }

        Ok(report)
    }
}

/// Builder for [`Timeline`]
///
/// # Examples
///
/// ```rust,no_run
/// use mrepo::{FsMaterializer, Timeline};
///
/// # fn main() -> mrepo::Result<()> {
/// let timeline = Timeline::builder()
///     .materializer(FsMaterializer::new())
///     .debug_ids(true)
///     .open("/srv/repo/epel.timeline")?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct TimelineBuilder {
    materializer: Option<Box<dyn Materializer>>,
    debug_ids: bool,
}

impl fmt::Debug for TimelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineBuilder")
            .field("custom_materializer", &self.materializer.is_some())
            .field("debug_ids", &self.debug_ids)
            .finish()
    }
}

impl TimelineBuilder {
    /// Builder with the filesystem materializer and second-resolution ids
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom materializer
    pub fn materializer(mut self, materializer: impl Materializer + 'static) -> Self {
        self.materializer = Some(Box::new(materializer));
        self
    }

    /// Use microsecond-resolution snapshot ids
    pub fn debug_ids(mut self, enabled: bool) -> Self {
        self.debug_ids = enabled;
        self
    }

    /// See [`Timeline::create`]
    pub fn create(self, name: &str, source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<Timeline> {
        self.build(name, source.as_ref(), destination.as_ref(), None)
    }

    /// See [`Timeline::open`]
    ///
    /// # Errors
    ///
    /// [`TimelineError::CorruptState`] if the metadata in `path` records a
    /// different destination (the timeline was moved).
    pub fn open(self, path: impl AsRef<Path>) -> Result<Timeline> {
        let path = normalize_path(path.as_ref())?;
        let metadata_path = path.join(METADATA_FILE);
        info!("loading timeline instance from {:?}", metadata_path);

        let stored = TimelineState::load(&metadata_path)?;
        if stored.config.destination != path {
            return Err(TimelineError::corrupt(format!(
                "metadata in {:?} records destination {:?}",
                path, stored.config.destination
            )));
        }

        let config = stored.config.clone();
        self.build(&config.name, &config.source, &config.destination, Some(stored))
    }

    fn build(
        self,
        name: &str,
        source: &Path,
        destination: &Path,
        stored: Option<TimelineState>,
    ) -> Result<Timeline> {
        let materializer = self
            .materializer
            .unwrap_or_else(|| Box::new(FsMaterializer::new()));
        Timeline::construct(name, source, destination, stored, materializer, self.debug_ids)
    }
}
