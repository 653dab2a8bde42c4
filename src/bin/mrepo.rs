//! # mrepo CLI - Repository mirror timelines
//!
//! Command-line interface for the mrepo timeline library. Every subcommand
//! maps onto one timeline operation; the timeline persists its own state.
//!
//! ## Usage
//! ```bash
//! # Create a timeline and take the first snapshot with default links
//! mrepo create-repo epel /srv/mirror/epel /srv/repo/epel.timeline -i
//!
//! # Nightly snapshot, skipped if another job holds the lock
//! mrepo create-snapshot /srv/repo/epel.timeline --random-sleep 600 --lock
//!
//! # Pin a link to the last week
//! mrepo create-link /srv/repo/epel.timeline/stable --max-offset 7
//!
//! # Emergency stop
//! mrepo config /srv/repo/epel.timeline --freeze
//! ```

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use mrepo::utils::{entry_name, split_entry_path};
use mrepo::{
    FsMaterializer, LinkOptions, Materializer, RepositoryLock, SnapshotOptions, Timeline,
    TimelineError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// mrepo CLI - Snapshot retention and link pinning for mirrored repositories
#[derive(Parser)]
#[command(name = "mrepo")]
#[command(version)]
#[command(about = "Dated snapshots of mirrored repositories with pinned links")]
#[command(long_about = None)]
struct Cli {
    /// Log progress; `config` also lists snapshots and links
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change the settings of a timeline
    Config {
        /// Timeline directory
        repo: PathBuf,

        /// Retention limit (3-365); rotates immediately
        #[arg(long)]
        max_snapshots: Option<usize>,

        /// Colon-separated paths, relative to the source, to leave out
        #[arg(long)]
        excludes: Option<String>,

        /// Directory for diff reports between consecutive snapshots
        #[arg(long, conflicts_with = "disable_diff_log")]
        diff_log_path: Option<PathBuf>,

        /// Stop writing diff reports
        #[arg(long)]
        disable_diff_log: bool,

        /// Reject every change until unfrozen
        #[arg(long, conflicts_with = "unfreeze")]
        freeze: bool,

        /// Accept changes again
        #[arg(long)]
        unfreeze: bool,

        /// Drop snapshots and links that are missing on disk
        #[arg(long)]
        consistency_check: bool,
    },

    /// Create upstream, downstream and offset links
    CreateDefaultLinks {
        /// Timeline directory
        repo: PathBuf,
    },

    /// Create a link
    CreateLink {
        /// REPO/LINK
        link: PathBuf,

        /// Target snapshot id or path (default: newest)
        #[arg(long)]
        snapshot: Option<String>,

        /// Keep the link within the N newest snapshots (0 = unpinned)
        #[arg(long, default_value_t = 0)]
        max_offset: usize,
    },

    /// Create an untracked copy of the source or of a snapshot
    CreateNamedSnapshot {
        /// REPO/NAME
        snapshot: PathBuf,

        /// Snapshot id or path to copy instead of the source
        #[arg(long)]
        source_snapshot: Option<String>,

        #[command(flatten)]
        lock: LockArgs,
    },

    /// Create a timeline
    CreateRepo {
        /// Timeline name
        name: String,

        /// Directory to snapshot
        source: PathBuf,

        /// Directory holding snapshots and links
        destination: PathBuf,

        /// Take a first snapshot and create the default links
        #[arg(short, long)]
        initialize: bool,
    },

    /// Take a snapshot and rotate
    CreateSnapshot {
        /// Timeline directory
        repo: PathBuf,

        /// Sleep a random 1..=SECS seconds first
        #[arg(long, value_name = "SECS")]
        random_sleep: Option<u64>,

        /// Sleep SECS seconds afterwards
        #[arg(long, value_name = "SECS")]
        sleep_after: Option<u64>,

        #[command(flatten)]
        lock: LockArgs,
    },

    /// Delete a link
    DeleteLink {
        /// REPO/LINK
        link: PathBuf,
    },

    /// Delete a snapshot, or an untracked directory of that name
    DeleteSnapshot {
        /// REPO/ID
        snapshot: PathBuf,
    },

    /// Rename a link
    RenameLink {
        /// REPO/LINK
        link: PathBuf,

        /// New link name
        new_name: String,
    },

    /// Point a link at another snapshot
    UpdateLink {
        /// REPO/LINK
        link: PathBuf,

        /// Target snapshot id or path (default: newest)
        #[arg(long)]
        snapshot: Option<String>,
    },
}

#[derive(clap::Args)]
struct LockArgs {
    /// Skip the command when another job holds the repository lock
    #[arg(long)]
    lock: bool,

    /// How long to wait for the lock (e.g. "30s", "5m")
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    lock_timeout: Duration,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "mrepo=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    // Run command
    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let verbose = cli.verbose;
    match cli.command {
        Commands::Config {
            repo,
            max_snapshots,
            excludes,
            diff_log_path,
            disable_diff_log,
            freeze,
            unfreeze,
            consistency_check,
        } => {
            let diff_log = match (diff_log_path, disable_diff_log) {
                (Some(path), _) => Some(Some(path)),
                (None, true) => Some(None),
                (None, false) => None,
            };
            cmd_config(
                &repo,
                ConfigChanges {
                    max_snapshots,
                    excludes,
                    diff_log,
                    freeze,
                    unfreeze,
                    consistency_check,
                },
                verbose,
            )
        }
        Commands::CreateDefaultLinks { repo } => cmd_create_default_links(&repo),
        Commands::CreateLink {
            link,
            snapshot,
            max_offset,
        } => cmd_create_link(&link, snapshot, max_offset),
        Commands::CreateNamedSnapshot {
            snapshot,
            source_snapshot,
            lock,
        } => cmd_create_named_snapshot(&snapshot, source_snapshot, &lock),
        Commands::CreateRepo {
            name,
            source,
            destination,
            initialize,
        } => cmd_create_repo(&name, &source, &destination, initialize),
        Commands::CreateSnapshot {
            repo,
            random_sleep,
            sleep_after,
            lock,
        } => cmd_create_snapshot(&repo, random_sleep, sleep_after, &lock),
        Commands::DeleteLink { link } => cmd_delete_link(&link),
        Commands::DeleteSnapshot { snapshot } => cmd_delete_snapshot(&snapshot),
        Commands::RenameLink { link, new_name } => cmd_rename_link(&link, &new_name),
        Commands::UpdateLink { link, snapshot } => cmd_update_link(&link, snapshot),
    }
}

/// Requested changes of the `config` subcommand
struct ConfigChanges {
    max_snapshots: Option<usize>,
    excludes: Option<String>,
    diff_log: Option<Option<PathBuf>>,
    freeze: bool,
    unfreeze: bool,
    consistency_check: bool,
}

/// Show or change timeline settings
///
/// Changes are applied in this order: unfreeze, settings, consistency
/// check, freeze. The state and the settings file are saved at the end.
fn cmd_config(repo: &Path, changes: ConfigChanges, list: bool) -> anyhow::Result<()> {
    let mut timeline = open_timeline(repo)?;

    if changes.unfreeze {
        match timeline.unfreeze(&current_user()) {
            Some(holder) => println!("{} Unfrozen (was frozen by {})", "✓".green().bold(), holder.yellow()),
            None => println!("{} Timeline was not frozen", "!".yellow().bold()),
        }
    }

    if let Some(excludes) = &changes.excludes {
        timeline.set_excludes_str(excludes)?;
    }
    if let Some(diff_log) = &changes.diff_log {
        timeline.set_diff_log_path(diff_log.as_deref())?;
    }
    if let Some(max_snapshots) = changes.max_snapshots {
        timeline.set_max_snapshots(max_snapshots)?;
        let evicted = timeline.rotate_snapshots()?;
        if !evicted.is_empty() {
            println!("{} Rotated out {} snapshots", "✓".green().bold(), evicted.len().to_string().yellow());
        }
    }

    if changes.consistency_check {
        let report = timeline.consistency_check()?;
        if report.is_clean() {
            println!("{} Timeline is consistent", "✓".green().bold());
        } else {
            for name in &report.removed_links {
                println!("  {} link {}", "removed".red(), name.cyan());
            }
            for id in &report.removed_snapshots {
                println!("  {} snapshot {}", "removed".red(), id.yellow());
            }
        }
    }

    if changes.freeze {
        let user = current_user();
        timeline.freeze(&user)?;
        println!("{} Frozen by {}", "✓".green().bold(), user.yellow());
    }

    timeline.save()?;

    print_summary(&timeline);
    if list {
        print_contents(&timeline)?;
    }
    Ok(())
}

fn cmd_create_default_links(repo: &Path) -> anyhow::Result<()> {
    let mut timeline = open_timeline(repo)?;
    let created = timeline.create_default_links()?;

    if created.is_empty() {
        println!("{} All default links already exist", "!".yellow().bold());
    }
    for name in created {
        let link = timeline.link(&name).context("link vanished after creation")?;
        println!("{} Created link {} -> {}", "✓".green().bold(), name.cyan(), link.snapshot.yellow());
    }
    Ok(())
}

fn cmd_create_link(entry: &Path, snapshot: Option<String>, max_offset: usize) -> anyhow::Result<()> {
    let (repo, name) = split_entry(entry)?;
    let mut timeline = open_timeline(&repo)?;

    let mut options = LinkOptions::new().max_offset(max_offset);
    if let Some(snapshot) = snapshot {
        options = options.snapshot(entry_name(&snapshot));
    }
    let link = timeline.create_link(&name, options)?;

    println!("{} Created link {} -> {}", "✓".green().bold(), link.name.cyan(), link.snapshot.yellow());
    if link.is_pinned() {
        println!("  Max offset: {}", link.max_offset.to_string().cyan());
    }
    Ok(())
}

fn cmd_create_named_snapshot(entry: &Path, source_snapshot: Option<String>, lock: &LockArgs) -> anyhow::Result<()> {
    let (repo, name) = split_entry(entry)?;
    let Some(_guard) = take_lock(&repo, lock)? else {
        return Ok(());
    };
    let timeline = open_timeline(&repo)?;

    let start = Instant::now();
    let spinner = spinner(format!("Creating named snapshot {}...", name))?;
    let result = timeline.create_named_snapshot(&name, source_snapshot.map(|s| entry_name(&s)).as_deref());
    spinner.finish_and_clear();
    let path = result?;

    println!("{} Created named snapshot {}", "✓".green().bold(), name.yellow().bold());
    println!("  Path: {}", path.display().to_string().cyan());
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    Ok(())
}

fn cmd_create_repo(name: &str, source: &Path, destination: &Path, initialize: bool) -> anyhow::Result<()> {
    let mut timeline = Timeline::create(name, source, destination)?;
    timeline.save()?;

    println!("{} Created timeline {}", "✓".green().bold(), name.yellow().bold());
    println!("  Source: {}", timeline.source().display().to_string().cyan());
    println!("  Destination: {}", timeline.destination().display().to_string().cyan());

    if initialize {
        let spinner = spinner("Creating first snapshot...".to_string())?;
        let result = timeline.create_snapshot(SnapshotOptions::new());
        spinner.finish_and_clear();
        let id = result?;
        println!("{} Created snapshot {}", "✓".green().bold(), id.yellow());

        let created = timeline.create_default_links()?;
        println!("{} Created links: {}", "✓".green().bold(), created.join(", ").cyan());
    }
    Ok(())
}

fn cmd_create_snapshot(
    repo: &Path,
    random_sleep: Option<u64>,
    sleep_after: Option<u64>,
    lock: &LockArgs,
) -> anyhow::Result<()> {
    let Some(_guard) = take_lock(repo, lock)? else {
        return Ok(());
    };
    let mut timeline = open_timeline(repo)?;

    let mut options = SnapshotOptions::new();
    if let Some(seconds) = random_sleep {
        options = options.random_sleep_before(Duration::from_secs(seconds));
    }
    if let Some(seconds) = sleep_after {
        options = options.sleep_after(Duration::from_secs(seconds));
    }

    let start = Instant::now();
    let spinner = spinner("Creating snapshot...".to_string())?;
    let result = timeline.create_snapshot(options);
    spinner.finish_and_clear();
    let id = result?;

    println!("{} Created snapshot {}", "✓".green().bold(), id.yellow().bold());
    println!(
        "  Snapshots: {}/{}",
        timeline.sequence().len().to_string().cyan(),
        timeline.max_snapshots()
    );
    if let Some(report) = timeline.snapshot(&id).and_then(|s| s.diff_log_file.as_ref()) {
        println!("  Diff report: {}", report.display().to_string().cyan());
    }
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    Ok(())
}

fn cmd_delete_link(entry: &Path) -> anyhow::Result<()> {
    let (repo, name) = split_entry(entry)?;
    let mut timeline = open_timeline(&repo)?;

    let link = timeline.delete_link(&name)?;
    println!("{} Deleted link {} (was {})", "✓".green().bold(), link.name.cyan(), link.snapshot.yellow());
    Ok(())
}

/// Delete a tracked snapshot, falling back to untracked directories
///
/// Named snapshots live next to tracked ones but are not part of the
/// metadata; they are removed directly. Symbolic links are never removed
/// this way.
fn cmd_delete_snapshot(entry: &Path) -> anyhow::Result<()> {
    let (repo, name) = split_entry(entry)?;
    let mut timeline = open_timeline(&repo)?;

    match timeline.delete_snapshot(&name) {
        Ok(snapshot) => {
            println!("{} Deleted snapshot {}", "✓".green().bold(), snapshot.id.yellow());
            Ok(())
        }
        Err(TimelineError::UnknownSnapshot(_)) => {
            let path = timeline.destination().join(&name);
            let is_dir = fs::symlink_metadata(&path)
                .map(|m| m.file_type().is_dir())
                .unwrap_or(false);
            if !is_dir {
                return Err(TimelineError::UnknownSnapshot(name).into());
            }

            FsMaterializer::new().remove_tree(&path)?;
            println!("{} Deleted untracked snapshot {}", "✓".green().bold(), name.yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_rename_link(entry: &Path, new_name: &str) -> anyhow::Result<()> {
    let (repo, name) = split_entry(entry)?;
    let mut timeline = open_timeline(&repo)?;

    let link = timeline.rename_link(&name, new_name)?;
    println!("{} Renamed link {} to {}", "✓".green().bold(), name.cyan(), link.name.cyan().bold());
    Ok(())
}

fn cmd_update_link(entry: &Path, snapshot: Option<String>) -> anyhow::Result<()> {
    let (repo, name) = split_entry(entry)?;
    let mut timeline = open_timeline(&repo)?;

    let target = snapshot.map(|s| entry_name(&s));
    timeline.update_link(&name, target.as_deref())?;

    let link = timeline.link(&name).context("link vanished after update")?;
    println!("{} Updated link {} -> {}", "✓".green().bold(), name.cyan(), link.snapshot.yellow());
    Ok(())
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn open_timeline(repo: &Path) -> anyhow::Result<Timeline> {
    Timeline::open(repo).with_context(|| format!("failed to open timeline {}", repo.display()))
}

fn split_entry(entry: &Path) -> anyhow::Result<(PathBuf, String)> {
    split_entry_path(entry).ok_or_else(|| anyhow!("expected REPO/NAME, got {}", entry.display()))
}

/// Take the repository lock if requested
///
/// `Ok(None)` means another job holds the lock and the command should be
/// skipped.
fn take_lock(repo: &Path, args: &LockArgs) -> anyhow::Result<Option<Option<RepositoryLock>>> {
    if !args.lock {
        return Ok(Some(None));
    }

    match RepositoryLock::acquire(repo, args.lock_timeout)? {
        Some(lock) => Ok(Some(Some(lock))),
        None => {
            let holder = RepositoryLock::holder(repo).unwrap_or_else(|| "unknown".to_string());
            println!("{} Repository is locked by {}, skipping", "!".yellow().bold(), holder.yellow());
            Ok(None)
        }
    }
}

fn spinner(message: String) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// `user@host` recorded when freezing
fn current_user() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", user, host)
}

fn round(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

fn print_summary(timeline: &Timeline) {
    println!("{}", timeline.name().bold());
    println!("  Source: {}", timeline.source().display().to_string().cyan());
    println!("  Destination: {}", timeline.destination().display().to_string().cyan());
    println!("  Max snapshots: {}", timeline.max_snapshots().to_string().cyan());
    let excludes: Vec<String> = timeline.excludes().iter().map(|p| p.display().to_string()).collect();
    println!("  Excludes: {}", excludes.join(":").cyan());
    if let Some(path) = timeline.diff_log_path() {
        println!("  Diff log path: {}", path.display().to_string().cyan());
    }
    match timeline.frozen_by() {
        Some(user) => println!("  Frozen: {}", user.red().bold()),
        None => println!("  Frozen: {}", "no".green()),
    }
}

fn print_contents(timeline: &Timeline) -> anyhow::Result<()> {
    println!("\n{}", "Snapshots".bold());
    for snapshot in timeline.snapshots() {
        let offset = timeline.offset_of(&snapshot.id)?;
        let marker = if timeline.is_snapshot_valid(&snapshot.id) {
            "●".green()
        } else {
            "✗".red()
        };
        let links: Vec<&str> = snapshot.links.iter().map(String::as_str).collect();
        println!(
            "  {} {:>4} {} {}",
            marker,
            offset,
            snapshot.id.yellow(),
            links.join(", ").cyan()
        );
    }

    println!("\n{}", "Links".bold());
    for link in timeline.links() {
        let marker = if timeline.is_link_valid(&link.name) {
            "●".green()
        } else {
            "✗".red()
        };
        let window = if link.is_pinned() {
            format!("max offset {}", link.max_offset)
        } else {
            "unpinned".to_string()
        };
        println!(
            "  {} {} -> {} ({})",
            marker,
            link.name.cyan(),
            link.snapshot.yellow(),
            window.dimmed()
        );
    }
    Ok(())
}
