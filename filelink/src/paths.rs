//! Root-confined path resolution.
//!
//! Requested names are resolved strictly inside the served root directory.
//! Both the root and the candidate are canonicalized, so `..` components
//! and symlinks pointing outside the root are caught by the same
//! containment check.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Resolve `name` under `root`, rejecting anything that escapes it or is
/// not a regular file.
///
/// `root` is expected to be canonical already (the serve loops
/// canonicalize it once at startup).
pub fn resolve_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    let candidate = root.join(name);

    // Canonicalization fails for names that do not resolve at all, which
    // for the protocol is the same outcome as a missing file.
    let resolved = candidate
        .canonicalize()
        .map_err(|_| Error::FileUnavailable)?;

    if !resolved.starts_with(root) {
        return Err(Error::PathOutsideRoot);
    }

    let meta = resolved.metadata().map_err(|_| Error::FileUnavailable)?;
    if !meta.is_file() {
        return Err(Error::FileUnavailable);
    }

    Ok(resolved)
}
