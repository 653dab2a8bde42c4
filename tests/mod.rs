//! Main test module for mrepo
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end timeline scenarios
//! - Chaos tests for failed materialization and on-disk drift
//! - Property-based tests for retention and pinning invariants

pub mod chaos;
pub mod integration;

/// Shared fixtures
pub mod support {
    use ::mrepo::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Materializer that creates empty snapshot directories
    ///
    /// Keeps property and chaos runs fast; links are real symbolic links so
    /// validity checks behave as with [`FsMaterializer`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct DirMaterializer;

    impl Materializer for DirMaterializer {
        fn clone_with_hardlinks(&self, _source: &Path, dest: &Path, _excludes: &[PathBuf]) -> Result<()> {
            fs::create_dir(dest).map_err(|e| TimelineError::materialization("clone", dest, e))
        }

        fn replace_subpaths(&self, _dest: &Path, _source: &Path, _dirs: &[String], _files: &[String]) -> Result<()> {
            Ok(())
        }

        fn remove_tree(&self, path: &Path) -> Result<()> {
            FsMaterializer::new().remove_tree(path)
        }

        fn create_symlink(&self, target_id: &str, link_path: &Path) -> Result<()> {
            FsMaterializer::new().create_symlink(target_id, link_path)
        }

        fn replace_symlink(&self, target_id: &str, link_path: &Path) -> Result<()> {
            FsMaterializer::new().replace_symlink(target_id, link_path)
        }

        fn remove_symlink(&self, link_path: &Path) -> Result<()> {
            FsMaterializer::new().remove_symlink(link_path)
        }
    }

    /// Source and destination directories of one test timeline
    pub struct Workspace {
        pub temp_dir: TempDir,
        pub source: PathBuf,
        pub destination: PathBuf,
    }

    impl Workspace {
        /// RPM-style source tree
        pub fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let source = temp_dir.path().join("mirror");
            fs::create_dir_all(source.join("Packages")).unwrap();
            fs::create_dir_all(source.join("repodata")).unwrap();
            fs::write(source.join("Packages/bash-4.2.rpm"), "bash").unwrap();
            fs::write(source.join("Packages/zsh-5.0.rpm"), "zsh").unwrap();
            fs::write(source.join("repodata/repomd.xml"), "<repomd/>").unwrap();
            let destination = temp_dir.path().join("mirror.timeline");
            Self {
                temp_dir,
                source,
                destination,
            }
        }

        /// Timeline using the real filesystem materializer
        pub fn timeline(&self) -> Timeline {
            TimelineBuilder::new()
                .debug_ids(true)
                .create("mirror", &self.source, &self.destination)
                .unwrap()
        }

        /// Timeline using [`DirMaterializer`]
        pub fn light_timeline(&self) -> Timeline {
            TimelineBuilder::new()
                .materializer(DirMaterializer)
                .debug_ids(true)
                .create("mirror", &self.source, &self.destination)
                .unwrap()
        }
    }

    /// Take a snapshot, spacing ids apart
    pub fn snapshot(timeline: &mut Timeline) -> String {
        thread::sleep(Duration::from_millis(1));
        timeline.create_snapshot(SnapshotOptions::new()).unwrap()
    }

    /// Take `count` snapshots
    pub fn snapshots(timeline: &mut Timeline, count: usize) -> Vec<String> {
        (0..count).map(|_| snapshot(timeline)).collect()
    }
}

#[cfg(test)]
mod edge_cases {
    use super::support::*;
    use ::mrepo::*;
    use std::fs;

    #[test]
    fn test_name_validation() {
        let workspace = Workspace::new();

        assert!(matches!(
            Timeline::create("bad name!", &workspace.source, &workspace.destination),
            Err(TimelineError::InvalidName { .. })
        ));
        let timeline = Timeline::create("my-repo.v1", &workspace.source, &workspace.destination).unwrap();
        assert_eq!(timeline.name(), "my-repo.v1");
    }

    #[test]
    fn test_empty_source() {
        let workspace = Workspace::new();
        fs::remove_dir_all(&workspace.source).unwrap();
        fs::create_dir(&workspace.source).unwrap();

        let mut timeline = workspace.timeline();
        let id = snapshot(&mut timeline);

        assert!(timeline.is_snapshot_valid(&id));
        assert_eq!(fs::read_dir(workspace.destination.join(&id)).unwrap().count(), 0);
    }

    #[test]
    fn test_operations_on_empty_timeline() {
        let workspace = Workspace::new();
        let mut timeline = workspace.timeline();

        assert!(matches!(timeline.latest_snapshot(), Err(TimelineError::NoSnapshots)));
        assert!(matches!(timeline.update_link("stable", None), Err(TimelineError::NoSnapshots)));
        assert!(matches!(timeline.create_default_links(), Err(TimelineError::NoSnapshots)));
        assert!(timeline.rotate_snapshots().unwrap().is_empty());
        assert!(timeline.consistency_check().unwrap().is_clean());
    }

    #[test]
    fn test_retention_limit_bounds() {
        let workspace = Workspace::new();
        let mut timeline = workspace.timeline();

        assert!(matches!(timeline.set_max_snapshots(2), Err(TimelineError::InvalidConfig(_))));
        assert!(matches!(timeline.set_max_snapshots(366), Err(TimelineError::InvalidConfig(_))));
        timeline.set_max_snapshots(3).unwrap();
        timeline.set_max_snapshots(365).unwrap();
        assert_eq!(timeline.max_snapshots(), 365);
    }

    #[test]
    fn test_lowering_limit_and_rotating() {
        let workspace = Workspace::new();
        let mut timeline = workspace.light_timeline();
        let ids = snapshots(&mut timeline, 6);

        timeline.set_max_snapshots(4).unwrap();
        // Not rotated until asked
        assert_eq!(timeline.sequence().len(), 6);

        let evicted = timeline.rotate_snapshots().unwrap();
        assert_eq!(evicted, ids[..2].to_vec());
        assert_eq!(timeline.sequence(), &ids[2..]);
    }

    #[test]
    fn test_pin_window_wider_than_timeline() {
        let workspace = Workspace::new();
        let mut timeline = workspace.light_timeline();
        let first = snapshot(&mut timeline);
        timeline
            .create_link("offset007", LinkOptions::new().max_offset(7))
            .unwrap();

        snapshots(&mut timeline, 3);
        // Offset 4 is still inside the window
        assert_eq!(timeline.link("offset007").unwrap().snapshot, first);
    }

    #[test]
    fn test_frozen_timeline_rotation_without_work() {
        let workspace = Workspace::new();
        let mut timeline = workspace.light_timeline();
        snapshots(&mut timeline, 2);

        timeline.freeze("ops@mirror").unwrap();
        // Nothing to evict or repin, so the gate is not hit
        assert!(timeline.rotate_snapshots().unwrap().is_empty());
        assert_eq!(timeline.frozen_by(), Some("ops@mirror"));
    }
}
