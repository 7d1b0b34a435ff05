//! Workspace sandbox
//!
//! Every client supplied path goes through [`resolve_safe_path`] before any
//! filesystem access. The result is canonical and is `root` or lies under it.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Path escapes workspace root")]
    Escape,
    #[error("Path exceeds maximum length")]
    TooLong,
    #[error("Path contains an invalid character")]
    InvalidCharacter,
    #[error("Failed to resolve path: {0}")]
    Io(#[from] io::Error),
}

/// Validate and resolve `relative_path` within `workspace_root`.
///
/// `.` and `..` are folded lexically first, then the deepest existing
/// ancestor is canonicalized (following symlinks) and the missing tail is
/// appended back, so paths that do not exist yet (write targets) resolve too.
pub fn resolve_safe_path(workspace_root: &Path, relative_path: &str) -> Result<PathBuf, PathError> {
    if relative_path.len() > MAX_PATH_LENGTH {
        return Err(PathError::TooLong);
    }
    if relative_path.contains('\0') {
        return Err(PathError::InvalidCharacter);
    }

    let mut components = Vec::new();
    for component in relative_path.split(['/', '\\']) {
        match component {
            "" | "." => continue,
            ".." => {
                if components.pop().is_none() {
                    return Err(PathError::Escape);
                }
            }
            c => components.push(c),
        }
    }

    let root_canonical = workspace_root.canonicalize()?;
    let mut existing = root_canonical.clone();
    for component in &components {
        existing.push(component);
    }

    // Walk up until something exists (a dangling symlink counts as existing).
    let mut missing = Vec::new();
    while let Err(e) = existing.symlink_metadata() {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(PathError::Io(e));
        }
        match existing.file_name() {
            Some(name) => missing.push(name.to_os_string()),
            None => return Err(PathError::Escape),
        }
        existing.pop();
    }

    let mut resolved = match existing.canonicalize() {
        Ok(p) => p,
        // Dangling symlink: its target cannot be verified.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PathError::Escape),
        Err(e) => return Err(PathError::Io(e)),
    };
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }

    // Component-wise comparison: /a/user does not contain /a/user2.
    if !resolved.starts_with(&root_canonical) {
        warn!(
            path = %relative_path,
            resolved = ?resolved,
            root = ?root_canonical,
            "Path escape attempt"
        );
        return Err(PathError::Escape);
    }

    Ok(resolved)
}

/// Path of `absolute` relative to `root`, with `/` separators.
/// `None` for the root itself or anything outside it.
pub fn relative_display(root: &Path, absolute: &Path) -> Option<String> {
    let rel = absolute.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
