//! End-to-end integration tests for mrepo
//!
//! Runs the timeline against real source trees with the filesystem
//! materializer and checks both the metadata and the resulting directory.

use crate::support::*;
use ::mrepo::*;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_rotation_evicts_oldest_snapshot() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    timeline.set_max_snapshots(3).unwrap();

    let ids = snapshots(&mut timeline, 4);

    assert_eq!(timeline.sequence(), &ids[1..]);
    assert!(timeline.snapshot(&ids[0]).is_none());
    assert!(!workspace.destination.join(&ids[0]).exists());
    for id in &ids[1..] {
        assert!(workspace.destination.join(id).join("Packages/bash-4.2.rpm").exists());
    }
}

#[test]
fn test_retention_holds_after_every_snapshot() {
    let workspace = Workspace::new();
    let mut timeline = workspace.light_timeline();
    timeline.set_max_snapshots(3).unwrap();

    for _ in 0..8 {
        snapshot(&mut timeline);
        assert!(timeline.sequence().len() <= 3);
    }
}

#[test]
fn test_upstream_link_follows_newest() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();

    let s1 = snapshot(&mut timeline);
    timeline
        .create_link("L", LinkOptions::new().max_offset(1))
        .unwrap();
    assert_eq!(timeline.link("L").unwrap().snapshot, s1);

    let s2 = snapshot(&mut timeline);
    let link = timeline.link("L").unwrap();
    assert_eq!(link.snapshot, s2);
    assert_eq!(timeline.offset_of(&link.snapshot).unwrap(), 1);
    assert_eq!(fs::read_link(&link.path).unwrap(), PathBuf::from(&s2));
}

#[test]
fn test_pinned_links_stay_in_window() {
    let workspace = Workspace::new();
    let mut timeline = workspace.light_timeline();
    timeline.set_max_snapshots(10).unwrap();

    let first = snapshot(&mut timeline);
    for (name, offset) in [("a", 1), ("b", 2), ("c", 5)] {
        timeline
            .create_link(name, LinkOptions::new().snapshot(&first).max_offset(offset))
            .unwrap();
    }

    for _ in 0..12 {
        snapshot(&mut timeline);
        for link in timeline.links() {
            let offset = timeline.offset_of(&link.snapshot).unwrap();
            assert!(offset <= link.max_offset, "{} at offset {}", link.name, offset);
        }
    }

    // Links sit exactly on the edge of their window
    assert_eq!(timeline.offset_of(&timeline.link("c").unwrap().snapshot).unwrap(), 5);
}

#[test]
fn test_delete_only_snapshot_removes_link() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();

    let s1 = snapshot(&mut timeline);
    timeline.create_link("L", LinkOptions::new()).unwrap();
    assert!(fs::symlink_metadata(workspace.destination.join("L")).is_ok());

    timeline.delete_snapshot(&s1).unwrap();

    assert!(timeline.link("L").is_none());
    assert!(fs::symlink_metadata(workspace.destination.join("L")).is_err());
    assert!(timeline.sequence().is_empty());
}

#[test]
fn test_delete_snapshot_never_leaves_dangling_links() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    let ids = snapshots(&mut timeline, 4);
    for (i, id) in ids.iter().enumerate() {
        timeline
            .create_link(&format!("link{}", i), LinkOptions::new().snapshot(id))
            .unwrap();
    }

    timeline.delete_snapshot(&ids[0]).unwrap();
    timeline.delete_snapshot(&ids[3]).unwrap();

    for link in timeline.links() {
        assert!(timeline.snapshot(&link.snapshot).is_some());
        assert!(timeline.is_link_valid(&link.name));
    }
    assert_eq!(timeline.link("link0").unwrap().snapshot, ids[1]);
    assert_eq!(timeline.link("link3").unwrap().snapshot, ids[2]);
    timeline.state().validate().unwrap();
}

#[test]
fn test_save_and_load_round_trip() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    timeline.set_max_snapshots(30).unwrap();
    timeline.set_excludes_str("Packages/zsh-5.0.rpm").unwrap();
    let ids = snapshots(&mut timeline, 3);
    timeline
        .create_link("stable", LinkOptions::new().snapshot(&ids[0]).max_offset(7).warn_before_max_offset(5))
        .unwrap();
    timeline.freeze("ops@mirror").unwrap();
    timeline.save().unwrap();

    let loaded = Timeline::open(&workspace.destination).unwrap();

    assert_eq!(loaded.state(), timeline.state());
    assert_eq!(loaded.max_snapshots(), 30);
    assert_eq!(loaded.excludes(), &[PathBuf::from("Packages/zsh-5.0.rpm")]);
    assert_eq!(loaded.frozen_by(), Some("ops@mirror"));
    assert_eq!(loaded.link("stable").unwrap().warn_before_max_offset, 5);
}

#[test]
fn test_freeze_blocks_mutations() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    let id = snapshot(&mut timeline);
    timeline.create_link("stable", LinkOptions::new()).unwrap();
    timeline.freeze("ops@mirror").unwrap();
    timeline.save().unwrap();

    // Freeze survives reopening
    let mut timeline = Timeline::open(&workspace.destination).unwrap();
    let before = timeline.state().clone();

    let frozen = |result: Result<()>| matches!(result, Err(TimelineError::Frozen(ref user)) if user == "ops@mirror");
    assert!(frozen(timeline.create_snapshot(SnapshotOptions::new()).map(|_| ())));
    assert!(frozen(timeline.create_link("other", LinkOptions::new()).map(|_| ())));
    assert!(frozen(timeline.delete_link("stable").map(|_| ())));
    assert!(frozen(timeline.delete_snapshot(&id).map(|_| ())));
    assert!(frozen(timeline.update_link("stable", None)));
    assert_eq!(timeline.state(), &before);

    let named = timeline.create_named_snapshot("pre-release", None).unwrap();
    assert!(named.join("repodata/repomd.xml").exists());
    assert_eq!(timeline.state(), &before);
}

#[test]
fn test_snapshots_share_files_with_source() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    let id = snapshot(&mut timeline);
    let snapshot_dir = workspace.destination.join(&id);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let inode = |p: PathBuf| fs::metadata(p).unwrap().ino();

        assert_eq!(
            inode(workspace.source.join("Packages/bash-4.2.rpm")),
            inode(snapshot_dir.join("Packages/bash-4.2.rpm"))
        );
        // Repository metadata is copied
        assert_ne!(
            inode(workspace.source.join("repodata/repomd.xml")),
            inode(snapshot_dir.join("repodata/repomd.xml"))
        );
    }

    fs::write(workspace.source.join("repodata/repomd.xml"), "<repomd rev=\"2\"/>").unwrap();
    assert_eq!(
        fs::read_to_string(snapshot_dir.join("repodata/repomd.xml")).unwrap(),
        "<repomd/>"
    );
}

#[test]
fn test_excludes() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();

    assert!(matches!(timeline.set_excludes_str("/etc"), Err(TimelineError::InvalidConfig(_))));
    assert!(matches!(timeline.set_excludes_str("missing"), Err(TimelineError::InvalidConfig(_))));
    assert!(matches!(timeline.set_excludes_str("../mirror"), Err(TimelineError::InvalidConfig(_))));
    assert!(timeline.excludes().is_empty());

    timeline.set_excludes_str("Packages/zsh-5.0.rpm").unwrap();
    let id = snapshot(&mut timeline);
    let snapshot_dir = workspace.destination.join(&id);
    assert!(snapshot_dir.join("Packages/bash-4.2.rpm").exists());
    assert!(!snapshot_dir.join("Packages/zsh-5.0.rpm").exists());

    timeline.set_excludes_str("").unwrap();
    assert!(timeline.excludes().is_empty());
}

#[test]
fn test_named_snapshot_from_tracked_snapshot() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    let id = snapshot(&mut timeline);

    fs::write(workspace.source.join("Packages/new.rpm"), "new").unwrap();
    let named = timeline.create_named_snapshot("release-7.1", Some(&id)).unwrap();

    assert!(named.join("Packages/bash-4.2.rpm").exists());
    assert!(!named.join("Packages/new.rpm").exists());
    assert!(timeline.snapshot("release-7.1").is_none());
    assert!(matches!(
        timeline.delete_snapshot("release-7.1"),
        Err(TimelineError::UnknownSnapshot(_))
    ));
    assert!(matches!(
        timeline.create_named_snapshot("release-7.1", None),
        Err(TimelineError::Materialization { .. })
    ));
    assert!(matches!(
        timeline.create_named_snapshot("bad name!", None),
        Err(TimelineError::InvalidName { .. })
    ));
}

#[test]
fn test_debian_source_defaults() {
    let workspace = Workspace::new();
    fs::create_dir_all(workspace.source.join("dists/stable/main/binary-amd64")).unwrap();
    fs::write(workspace.source.join("dists/stable/Release"), "Suite: stable").unwrap();
    fs::write(workspace.source.join("dists/stable/main/binary-amd64/Packages"), "Package: bash").unwrap();

    let mut timeline = workspace.timeline();
    assert!(timeline.config().copy_dirs_recursive.contains(&"binary-*".to_string()));
    assert!(timeline.config().copy_files_recursive.contains(&"Release".to_string()));

    let id = snapshot(&mut timeline);
    fs::write(workspace.source.join("dists/stable/Release"), "Suite: changed").unwrap();
    let copied = workspace.destination.join(&id).join("dists/stable/Release");
    assert_eq!(fs::read_to_string(copied).unwrap(), "Suite: stable");
}

#[test]
fn test_settings_file_changes_apply_on_open() {
    let workspace = Workspace::new();
    let timeline = workspace.timeline();
    timeline.save().unwrap();

    let settings_path = workspace.destination.join(config::SETTINGS_FILE);
    let mut settings = TimelineSettings::load(&settings_path).unwrap();
    settings.max_snapshots = 7;
    settings.advanced.excludes = vec!["Packages/zsh-5.0.rpm".to_string()];
    settings.save(&settings_path).unwrap();

    let reopened = Timeline::open(&workspace.destination).unwrap();
    assert_eq!(reopened.max_snapshots(), 7);
    assert_eq!(reopened.excludes(), &[PathBuf::from("Packages/zsh-5.0.rpm")]);

    // Invalid operator edits are rejected
    settings.max_snapshots = 1000;
    settings.save(&settings_path).unwrap();
    assert!(matches!(
        Timeline::open(&workspace.destination),
        Err(TimelineError::InvalidConfig(_))
    ));
}

#[test]
fn test_default_links_on_full_timeline() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    snapshot(&mut timeline);

    let created = timeline.create_default_links().unwrap();
    assert_eq!(created.len(), 9);
    assert_eq!(timeline.link("upstream").unwrap().max_offset, 1);
    assert!(!timeline.link("downstream").unwrap().is_pinned());
    assert_eq!(timeline.link("offset090").unwrap().max_offset, 90);
    for name in &created {
        assert!(workspace.destination.join(name).join("repodata").exists());
    }
}

#[test]
fn test_locked_snapshot_job() {
    let workspace = Workspace::new();
    let mut timeline = workspace.timeline();
    timeline.save().unwrap();

    let lock = RepositoryLock::acquire(&workspace.destination, Duration::ZERO)
        .unwrap()
        .unwrap();
    assert!(RepositoryLock::acquire(&workspace.destination, Duration::ZERO).unwrap().is_none());

    // The lock file does not disturb the timeline
    snapshot(&mut timeline);
    assert!(timeline.consistency_check().unwrap().is_clean());
    drop(lock);

    assert!(RepositoryLock::acquire(&workspace.destination, Duration::ZERO).unwrap().is_some());
}
