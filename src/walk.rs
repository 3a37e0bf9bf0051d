//! Prefix tree enumeration.

use std::path::Path;

use walkdir::WalkDir;

use crate::error::{PackError, Result};
use crate::FileSet;

/// Enumerate every non-directory entry under `prefix`.
///
/// Paths are relative to `prefix` and use `/` separators. Symlinks are
/// reported (including links to directories) but never followed, so a
/// linked directory shows up as a single entry and cannot cause cycles.
/// Real directories are descended into but never reported themselves.
pub fn walk_files(prefix: &Path) -> Result<FileSet> {
    let mut files = FileSet::new();

    for entry in WalkDir::new(prefix).follow_links(false).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        files.insert(relative_path(prefix, entry.path())?);
    }

    Ok(files)
}

/// Express `path` relative to `prefix` with forward slashes.
pub(crate) fn relative_path(prefix: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(prefix).unwrap_or(path);
    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| PackError::NonUtf8Path {
                path: path.to_path_buf(),
            })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}
