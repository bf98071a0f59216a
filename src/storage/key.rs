use crate::storage::StorageError;

/// Normalize a storage key into forward-slash separated segments rooted at
/// the store.
///
/// `\` is treated as a separator, empty and `.` segments are dropped and `..`
/// pops the previous segment. A key that pops past the root, resolves to
/// nothing, or carries a drive prefix, `:` or NUL is rejected.
pub fn normalize_key(key: &str) -> Result<String, StorageError> {
    let invalid = || StorageError::InvalidKey(key.to_string());

    if key.contains('\0') || key.contains(':') {
        return Err(invalid());
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in key.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(invalid());
                }
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(invalid());
    }

    Ok(segments.join("/"))
}

/// Split an already normalized key into its segments.
pub fn segments(normalized: &str) -> impl Iterator<Item = &str> {
    normalized.split('/')
}
