use crate::EngineError;
use std::path::{Component, Path, PathBuf};

/// Turns an expanded template into a path relative to a task's work directory.
///
/// Surrounding whitespace is trimmed and the path is normalized lexically
/// (`.`, `..` and repeated separators collapse). Empty, absolute and escaping
/// results are rejected with [`EngineError::UnsafePath`].
pub fn normalize_relative_path(raw: &str) -> Result<PathBuf, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(unsafe_path(raw, "path is empty"));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || Path::new(trimmed).is_absolute()
    {
        return Err(unsafe_path(raw, "path is absolute"));
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(unsafe_path(raw, "path escapes the work directory"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path(raw, "path is absolute"));
            }
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path(raw, "path is empty after normalization"));
    }
    Ok(parts.iter().collect())
}

/// True when `candidate` (already relative or absolute) stays under `root`
/// once both are lexically normalized.
pub fn path_is_within(root: &Path, candidate: &Path) -> bool {
    let relative = match candidate.strip_prefix(root) {
        Ok(rest) => rest,
        Err(_) if candidate.is_relative() => candidate,
        Err(_) => return false,
    };
    match relative.to_str() {
        Some(text) => normalize_relative_path(text).is_ok(),
        None => false,
    }
}

fn unsafe_path(raw: &str, reason: &str) -> EngineError {
    EngineError::UnsafePath {
        path: raw.to_string(),
        reason: reason.to_string(),
    }
}
