use crate::archive::PackageEntry;

/// Extensions a symbol package may contain.
pub const ALLOWED_EXTENSIONS: [&str; 6] = [".pdb", ".nuspec", ".xml", ".psmdcp", ".rels", ".p7s"];

pub const PDB_EXTENSION: &str = ".pdb";

/// Extension of a file name, including the dot, or "" when there is none.
/// A leading dot counts, so `.rels` has extension `.rels`.
pub fn extension(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(i) if i + 1 < file_name.len() => &file_name[i..],
        _ => "",
    }
}

fn is_valid_entry(entry: &PackageEntry) -> bool {
    !entry.file_name.is_empty()
        && !entry.extension.is_empty()
        && ALLOWED_EXTENSIONS.contains(&entry.extension.as_str())
}

/// Check every entry against the allow-list. One bad entry fails the lot.
pub fn validate_entries(entries: &[PackageEntry]) -> Result<(), String> {
    match entries.iter().find(|e| !is_valid_entry(e)) {
        Some(bad) => Err(format!("entry {:?} is not allowed in a symbol package", bad.path)),
        None => Ok(()),
    }
}
