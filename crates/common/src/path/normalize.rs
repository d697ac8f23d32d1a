// Bundle path canonicalization: NFKC, one separator, no traversal, bounded length.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

pub const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path escapes its root via `{0}`")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path is absolute: {0}")]
    Absolute(String),

    #[error("invalid path component `{0}`")]
    InvalidComponent(String),
}

/// Canonical relative form of a file path inside a bundle archive.
///
/// Backslashes become `/`, repeated separators collapse, and a leading `/` or
/// drive prefix is refused so every entry lands under the extraction root.
pub fn bundle_entry_path(input: &str) -> Result<String, PathError> {
    if input.is_empty() {
        return Err(PathError::Empty);
    }
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let normalized: String = input.nfkc().collect::<String>().replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(PathError::Absolute(input.to_string()));
    }

    let mut parts = Vec::new();
    for part in normalized.split('/').filter(|p| !p.is_empty()) {
        match part {
            "." | ".." => return Err(PathError::Traversal(part.to_string())),
            p if p.trim().is_empty() => {
                return Err(PathError::InvalidComponent(p.to_string()));
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }

    let joined = parts.join("/");
    if joined.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }
    Ok(joined)
}

/// A single directory name derived from an identifier (partition, module).
/// Separators are not allowed at all here.
pub fn storage_segment(input: &str) -> Result<String, PathError> {
    let canonical = bundle_entry_path(input)?;
    if canonical.contains('/') {
        return Err(PathError::InvalidComponent(input.to_string()));
    }
    Ok(canonical)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
