//! Chaos testing for mrepo
//!
//! Failing materializers, snapshots and links removed behind the timeline's
//! back, and damaged metadata. The timeline must either reject the input or
//! converge back to a consistent state through the consistency check.

use crate::support::*;
use ::mrepo::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::info;

/// Which materializer operations should fail
#[derive(Debug, Default)]
pub struct Faults {
    pub clone: Cell<bool>,
    pub symlink: Cell<bool>,
}

/// [`DirMaterializer`] with switchable failures
#[derive(Debug, Clone, Default)]
pub struct FlakyMaterializer {
    pub faults: Rc<Faults>,
}

impl FlakyMaterializer {
    fn fail(op: &'static str, path: &Path) -> TimelineError {
        TimelineError::materialization(op, path, std::io::Error::other("injected failure"))
    }
}

impl Materializer for FlakyMaterializer {
    fn clone_with_hardlinks(&self, source: &Path, dest: &Path, excludes: &[PathBuf]) -> Result<()> {
        if self.faults.clone.get() {
            return Err(Self::fail("clone_with_hardlinks", dest));
        }
        DirMaterializer.clone_with_hardlinks(source, dest, excludes)
    }

    fn replace_subpaths(&self, dest: &Path, source: &Path, dirs: &[String], files: &[String]) -> Result<()> {
        DirMaterializer.replace_subpaths(dest, source, dirs, files)
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        DirMaterializer.remove_tree(path)
    }

    fn create_symlink(&self, target_id: &str, link_path: &Path) -> Result<()> {
        if self.faults.symlink.get() {
            return Err(Self::fail("create_symlink", link_path));
        }
        DirMaterializer.create_symlink(target_id, link_path)
    }

    fn replace_symlink(&self, target_id: &str, link_path: &Path) -> Result<()> {
        if self.faults.symlink.get() {
            return Err(Self::fail("replace_symlink", link_path));
        }
        DirMaterializer.replace_symlink(target_id, link_path)
    }

    fn remove_symlink(&self, link_path: &Path) -> Result<()> {
        DirMaterializer.remove_symlink(link_path)
    }
}

fn flaky_timeline(workspace: &Workspace) -> (Timeline, Rc<Faults>) {
    let materializer = FlakyMaterializer::default();
    let faults = materializer.faults.clone();
    let timeline = TimelineBuilder::new()
        .materializer(materializer)
        .debug_ids(true)
        .create("mirror", &workspace.source, &workspace.destination)
        .unwrap();
    (timeline, faults)
}

#[test]
fn test_failed_clone_leaves_metadata_ahead() {
    let workspace = Workspace::new();
    let (mut timeline, faults) = flaky_timeline(&workspace);
    let good = snapshot(&mut timeline);

    faults.clone.set(true);
    let err = timeline.create_snapshot(SnapshotOptions::new()).unwrap_err();
    assert!(matches!(err, TimelineError::Materialization { op: "clone_with_hardlinks", .. }));
    faults.clone.set(false);

    // Recorded before the clone was attempted
    assert_eq!(timeline.sequence().len(), 2);
    let persisted = TimelineState::load(&workspace.destination.join(config::METADATA_FILE)).unwrap();
    assert_eq!(persisted.sequence.len(), 2);

    let report = timeline.consistency_check().unwrap();
    assert_eq!(report.removed_snapshots.len(), 1);
    assert_eq!(timeline.sequence(), &[good]);
}

#[test]
fn test_failed_symlink_is_repaired() {
    let workspace = Workspace::new();
    let (mut timeline, faults) = flaky_timeline(&workspace);
    snapshot(&mut timeline);

    faults.symlink.set(true);
    assert!(timeline.create_link("stable", LinkOptions::new()).is_err());
    faults.symlink.set(false);

    assert!(timeline.link("stable").is_some());
    assert!(!timeline.is_link_valid("stable"));

    let report = timeline.consistency_check().unwrap();
    assert_eq!(report.removed_links, vec!["stable".to_string()]);
    timeline.create_link("stable", LinkOptions::new()).unwrap();
    assert!(timeline.is_link_valid("stable"));
}

#[test]
fn test_missing_snapshot_is_dropped() {
    let workspace = Workspace::new();
    let mut timeline = workspace.light_timeline();
    let ids = snapshots(&mut timeline, 3);
    timeline
        .create_link("stable", LinkOptions::new().snapshot(&ids[0]))
        .unwrap();

    fs::remove_dir_all(workspace.destination.join(&ids[1])).unwrap();

    let report = timeline.consistency_check().unwrap();
    assert!(report.removed_links.is_empty());
    assert_eq!(report.removed_snapshots, vec![ids[1].clone()]);
    assert_eq!(timeline.link("stable").unwrap().snapshot, ids[0]);
    assert_eq!(timeline.sequence(), &[ids[0].clone(), ids[2].clone()]);
}

#[test]
fn test_consistency_check_while_frozen() {
    let workspace = Workspace::new();
    let mut timeline = workspace.light_timeline();
    let ids = snapshots(&mut timeline, 2);
    timeline.freeze("ops@mirror").unwrap();

    // Nothing to repair
    assert!(timeline.consistency_check().unwrap().is_clean());

    fs::remove_dir_all(workspace.destination.join(&ids[0])).unwrap();
    assert!(matches!(timeline.consistency_check(), Err(TimelineError::Frozen(_))));
    assert_eq!(timeline.sequence().len(), 2);
}

#[test]
fn test_corrupt_metadata_is_rejected() {
    let workspace = Workspace::new();
    let mut timeline = workspace.light_timeline();
    let id = snapshot(&mut timeline);
    timeline.create_link("stable", LinkOptions::new()).unwrap();
    let metadata = workspace.destination.join(config::METADATA_FILE);
    let pristine = fs::read_to_string(&metadata).unwrap();

    // Truncated JSON
    fs::write(&metadata, &pristine[..pristine.len() / 2]).unwrap();
    assert!(matches!(Timeline::open(&workspace.destination), Err(TimelineError::Json(_))));

    // Link pointing at an unknown snapshot
    let mut state: TimelineState = serde_json::from_str(&pristine).unwrap();
    state.links.get_mut("stable").unwrap().snapshot = "2000.01.01-000000".to_string();
    fs::write(&metadata, serde_json::to_string(&state).unwrap()).unwrap();
    assert!(matches!(Timeline::open(&workspace.destination), Err(TimelineError::CorruptState(_))));

    // Sequence out of step with the snapshot map
    let mut state: TimelineState = serde_json::from_str(&pristine).unwrap();
    state.sequence.push(id.clone());
    fs::write(&metadata, serde_json::to_string(&state).unwrap()).unwrap();
    assert!(matches!(Timeline::open(&workspace.destination), Err(TimelineError::CorruptState(_))));

    // Written by a newer version
    let mut state: TimelineState = serde_json::from_str(&pristine).unwrap();
    state.format_version += 1;
    fs::write(&metadata, serde_json::to_string(&state).unwrap()).unwrap();
    assert!(matches!(Timeline::open(&workspace.destination), Err(TimelineError::CorruptState(_))));

    fs::write(&metadata, &pristine).unwrap();
    assert!(Timeline::open(&workspace.destination).is_ok());
}

#[test]
fn test_moved_timeline_is_rejected() {
    let workspace = Workspace::new();
    let timeline = workspace.light_timeline();
    timeline.save().unwrap();

    let moved = workspace.temp_dir.path().join("moved.timeline");
    fs::rename(&workspace.destination, &moved).unwrap();
    assert!(matches!(Timeline::open(&moved), Err(TimelineError::CorruptState(_))));
}

#[test]
fn test_random_drift_converges() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    let mut timeline = workspace.light_timeline();
    timeline.set_max_snapshots(8)?;
    let mut rng = StdRng::seed_from_u64(42);

    let ids = snapshots(&mut timeline, 8);
    timeline.create_default_links()?;
    for (i, id) in ids.iter().enumerate() {
        timeline.create_link(&format!("chaos{}", i), LinkOptions::new().snapshot(id))?;
    }

    for round in 0..5 {
        // Remove random snapshot directories and symbolic links
        for id in timeline.sequence().to_vec() {
            if rng.random_bool(0.2) {
                fs::remove_dir_all(workspace.destination.join(&id))?;
            }
        }
        let names: Vec<String> = timeline.links().map(|l| l.name.clone()).collect();
        for name in names {
            if rng.random_bool(0.1) {
                let _ = fs::remove_file(workspace.destination.join(&name));
            }
        }

        let report = timeline.consistency_check()?;
        info!(
            "round {}: removed {} links and {} snapshots",
            round,
            report.removed_links.len(),
            report.removed_snapshots.len()
        );

        timeline.state().validate()?;
        assert!(timeline.sequence().iter().all(|id| timeline.is_snapshot_valid(id)));
        assert!(timeline.links().all(|l| timeline.is_link_valid(&l.name)));
        assert!(timeline.consistency_check()?.is_clean());

        snapshots(&mut timeline, 2);
    }

    Ok(())
}
