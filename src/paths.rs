use std::path::{Component, Path, PathBuf};

use crate::error::{LatchError, Result};

/// Lexically normalize an absolute path: drop `.` components and resolve `..`
/// against the components seen so far.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonical registry key for a file path.
///
/// Relative paths are resolved against `cwd`. The parent directory is
/// resolved through symlinks when it exists, so two spellings of the same
/// file map to the same key even if the file itself does not exist yet.
pub fn canonical_file_path(raw: &str, cwd: &Path) -> Result<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LatchError::InvalidPath(raw.into(), "empty path".into()));
    }
    let joined = if Path::new(trimmed).is_absolute() {
        PathBuf::from(trimmed)
    } else {
        cwd.join(trimmed)
    };
    let normalized = normalize(&joined);
    if !normalized.is_absolute() {
        return Err(LatchError::InvalidPath(
            raw.into(),
            "cannot resolve to an absolute path".into(),
        ));
    }

    if let Ok(resolved) = normalized.canonicalize() {
        return Ok(resolved);
    }
    match (normalized.parent(), normalized.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(normalized),
        },
        _ => Ok(normalized),
    }
}

pub fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// True when `path` lies inside `dir` (or is `dir`).
pub fn is_within(path: &Path, dir: &Path) -> bool {
    let dir = dir.canonicalize().unwrap_or_else(|_| normalize(dir));
    path.starts_with(&dir)
}
