//! Hierarchical key paths: slash-separated segments, no leading or
//! trailing slash, no empty segments. `users/u1/presence` is a descendant
//! of `users/u1` and of `users`.

use crate::StoreError;

pub fn validate(path: &str) -> Result<(), StoreError> {
    if path.is_empty() || path.split('/').any(|seg| seg.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Valid as a single segment inside a written object key.
pub fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') {
        return Err(StoreError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

/// True when `b` lies strictly below `a`.
pub fn is_ancestor(a: &str, b: &str) -> bool {
    b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'/'
}

/// Paths overlap when a write at one can change the value observed at the
/// other: equal, ancestor, or descendant.
pub fn overlaps(a: &str, b: &str) -> bool {
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}

/// Proper ancestors of `path`, nearest last: `a/b/c` -> `["a", "a/b"]`.
pub fn ancestors(path: &str) -> Vec<&str> {
    path.char_indices()
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| &path[..i])
        .collect()
}
