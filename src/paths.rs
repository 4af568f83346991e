//! Path derivation and traversal defense for adventure directories.
//!
//! Every on-disk path derived from an externally supplied adventure id
//! goes through [`confine`]: allow-list validation of the id, then a
//! canonicalize-and-prefix check that the resulting directory stays
//! inside the configured base directory.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maximum accepted id length. UUID strings are 36 characters.
const MAX_ID_LEN: usize = 64;

/// Errors from path derivation.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid adventure id: {0:?}")]
    InvalidId(String),

    #[error("base directory unavailable: {0}")]
    Base(#[source] std::io::Error),

    #[error("path escapes the adventure base directory: {0}")]
    Escape(PathBuf),
}

/// Check an id against the strict allow-list.
///
/// Accepted: 1 to 64 characters, each ASCII alphanumeric, `-`, or `_`.
/// Everything else is rejected, which excludes separators, `.` and `..`
/// segments, and empty names before any path is ever built.
pub fn validate_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Derive the directory for `id` under `base`, refusing anything that
/// resolves outside `base`.
///
/// The base directory must already exist so it can be canonicalized.
/// The returned path itself may not exist yet.
pub fn confine(base: &Path, id: &str) -> Result<PathBuf, PathError> {
    if !validate_id(id) {
        return Err(PathError::InvalidId(id.to_string()));
    }

    let canonical_base = base.canonicalize().map_err(PathError::Base)?;
    let candidate = canonical_base.join(id);

    // The allow-list already forbids separators, but re-verify the
    // resolved location in case this is ever called with an id that
    // bypassed validation.
    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        // Not created yet. The single joined component cannot climb.
        Err(_) => candidate.clone(),
    };
    if !resolved.starts_with(&canonical_base) {
        return Err(PathError::Escape(resolved));
    }

    Ok(candidate)
}
