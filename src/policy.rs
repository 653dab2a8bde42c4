//! Link pinning and rotation policy
//!
//! Pure functions over the ordered snapshot sequence (oldest first). They
//! never touch the filesystem; [`Timeline`](crate::Timeline) applies their
//! decisions.
//!
//! ## Offsets
//!
//! The offset of a snapshot is its age rank counted from the newest
//! snapshot, which always has offset 1:
//!
//! ```text
//! sequence:  [s1, s2, s3, s4]
//! offset:      4   3   2   1
//! ```
//!
//! A link with `max_offset = k > 0` must never point at a snapshot with an
//! offset above `k`. Rotation moves such links to the snapshot exactly `k`
//! positions old, so pinned links slide forward one step at a time.

use crate::error::{Result, TimelineError};
use crate::types::Link;

/// Offset of `id` from the newest snapshot (newest = 1)
///
/// # Errors
///
/// [`TimelineError::UnknownSnapshot`] if `id` is not in the sequence.
///
/// # Examples
///
/// ```rust
/// use mrepo::policy::offset_of;
///
/// let sequence = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
/// assert_eq!(offset_of(&sequence, "s3")?, 1);
/// assert_eq!(offset_of(&sequence, "s1")?, 3);
/// # Ok::<(), mrepo::TimelineError>(())
/// ```
pub fn offset_of(sequence: &[String], id: &str) -> Result<usize> {
    sequence
        .iter()
        .position(|s| s == id)
        .map(|index| sequence.len() - index)
        .ok_or_else(|| TimelineError::UnknownSnapshot(id.to_string()))
}

/// Whether a pinned link currently points beyond its window
///
/// Always `false` for unpinned links (`max_offset == 0`).
pub fn violates_max_offset(sequence: &[String], link: &Link) -> Result<bool> {
    if !link.is_pinned() {
        return Ok(false);
    }
    Ok(offset_of(sequence, &link.snapshot)? > link.max_offset)
}

/// Reassignment target for links of a snapshot that is being deleted
///
/// - single snapshot: the snapshot itself
/// - newest snapshot: its predecessor
/// - otherwise: its successor (the next more recent snapshot)
pub fn neighbour_of<'a>(sequence: &'a [String], id: &str) -> Result<&'a str> {
    let index = sequence
        .iter()
        .position(|s| s == id)
        .ok_or_else(|| TimelineError::UnknownSnapshot(id.to_string()))?;

    let neighbour = if sequence.len() == 1 {
        index
    } else if index == sequence.len() - 1 {
        index - 1
    } else {
        index + 1
    };

    Ok(&sequence[neighbour])
}

/// The snapshot exactly `max_offset` positions old
///
/// `None` when the link is unpinned or the window is not smaller than the
/// sequence, i.e. the window cannot have been exceeded yet.
pub fn pinned_target(sequence: &[String], max_offset: usize) -> Option<&str> {
    if max_offset == 0 || max_offset >= sequence.len() {
        return None;
    }
    sequence.get(sequence.len() - max_offset).map(String::as_str)
}

/// How many of the oldest snapshots rotation must evict
pub fn eviction_count(len: usize, max_snapshots: usize) -> usize {
    len.saturating_sub(max_snapshots)
}

/// Links that rotation must move, with their new targets
///
/// Links whose target is not in the sequence are skipped; the timeline's
/// invariants make that impossible for links it manages.
pub fn repin_plan<'a, I>(sequence: &'a [String], links: I) -> Vec<(String, &'a str)>
where
    I: IntoIterator<Item = &'a Link>,
{
    links
        .into_iter()
        .filter(|link| matches!(violates_max_offset(sequence, link), Ok(true)))
        .filter_map(|link| {
            pinned_target(sequence, link.max_offset).map(|target| (link.name.clone(), target))
        })
        .collect()
}
