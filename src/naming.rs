//! Identifier validation
//!
//! Timeline, snapshot and link names end up as file names inside the
//! destination directory, so they are restricted to alpha-numeric characters
//! plus a small set of extra characters.

use crate::error::{Result, TimelineError};

/// Extra characters allowed in timeline, snapshot and link names
pub const NAME_EXTRA_CHARS: &str = "-_.";

/// Check that `name` consists of ASCII alpha-numerics plus `allowed_extra`
///
/// Every character of `allowed_extra` is stripped first; the remainder must
/// be non-empty and fully alpha-numeric. A name made up only of extra
/// characters (e.g. `".."`) is therefore rejected.
///
/// # Examples
///
/// ```rust
/// use mrepo::naming::is_valid_name;
///
/// assert!(is_valid_name("my-repo.v1", "-_."));
/// assert!(!is_valid_name("bad name!", "-_."));
/// assert!(!is_valid_name("..", "-_."));
/// ```
pub fn is_valid_name(name: &str, allowed_extra: &str) -> bool {
    let stripped: String = name.chars().filter(|c| !allowed_extra.contains(*c)).collect();
    !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Validate a name with the default extra characters
///
/// `kind` is used in the error message ("timeline", "snapshot", "link").
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    if is_valid_name(name, NAME_EXTRA_CHARS) {
        Ok(())
    } else {
        Err(TimelineError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}
