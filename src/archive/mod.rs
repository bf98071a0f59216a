//! Symbol package (`.snupkg`) reading.
//!
//! Uploads are spooled to an anonymous temp file and read as a ZIP through
//! `async_zip`, so neither the archive nor its entries are held in memory.

pub mod nuspec;
pub mod validate;

use async_zip::tokio::read::seek::ZipFileReader;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::pdb::file_name;
use crate::utils::io::{spool_to_temp, Spooled};

pub use nuspec::PackageIdentity;
pub use validate::{validate_entries, ALLOWED_EXTENSIONS, PDB_EXTENSION};

const NUSPEC_EXTENSION: &str = ".nuspec";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive could not be read: {0}")]
    Parse(String),

    #[error("archive failed validation: {0}")]
    Validation(String),

    #[error("invalid package manifest: {0}")]
    Manifest(String),

    #[error("archive i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<async_zip::error::ZipError> for ArchiveError {
    fn from(e: async_zip::error::ZipError) -> Self {
        ArchiveError::Parse(e.to_string())
    }
}

/// One file entry of a symbol package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub index: usize,
    pub path: String,
    pub file_name: String,
    pub extension: String,
}

impl PackageEntry {
    pub fn new(index: usize, path: &str) -> Self {
        let name = file_name(path);
        Self {
            index,
            path: path.to_string(),
            file_name: name.to_string(),
            extension: validate::extension(name).to_string(),
        }
    }

    pub fn is_pdb(&self) -> bool {
        self.extension == PDB_EXTENSION
    }

    fn is_root_manifest(&self) -> bool {
        self.extension == NUSPEC_EXTENSION && !self.path.contains(['/', '\\'])
    }
}

/// Reject entry paths that would land outside an extraction root.
fn check_entry_path(path: &str) -> Result<(), ArchiveError> {
    let escapes = path.starts_with(['/', '\\'])
        || path.contains(':')
        || path.contains('\0')
        || path.split(['/', '\\']).any(|segment| segment == "..");
    if escapes {
        return Err(ArchiveError::Validation(format!("unsafe entry path {:?}", path)));
    }
    Ok(())
}

/// An uploaded symbol package, open for reading.
///
/// Holds the spooled archive; dropping it releases the temp file.
pub struct SymbolPackage {
    reader: ZipFileReader<BufReader<File>>,
    entries: Vec<PackageEntry>,
}

impl SymbolPackage {
    /// Spool `upload` (at most `max_size` bytes) and open it as an archive.
    pub async fn from_upload<R>(upload: &mut R, max_size: u64) -> Result<Self, ArchiveError>
    where
        R: AsyncRead + Unpin,
    {
        let spooled = spool_to_temp(upload, Some(max_size)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                ArchiveError::Validation(e.to_string())
            } else {
                ArchiveError::Io(e)
            }
        })?;
        debug!("Spooled upload of {} bytes", spooled.len);
        Self::open(spooled.file).await
    }

    /// Read the central directory and entry paths of a ZIP archive.
    pub async fn open(file: File) -> Result<Self, ArchiveError> {
        let reader = ZipFileReader::with_tokio(BufReader::new(file)).await?;

        let mut entries = Vec::new();
        for (index, stored) in reader.file().entries().iter().enumerate() {
            if stored.dir()? {
                continue;
            }
            let path = stored.filename().as_str()?;
            check_entry_path(path)?;
            entries.push(PackageEntry::new(index, path));
        }

        Ok(Self { reader, entries })
    }

    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    pub fn pdb_entries(&self) -> Vec<PackageEntry> {
        self.entries.iter().filter(|e| e.is_pdb()).cloned().collect()
    }

    /// Read the package id and version from the root `.nuspec`.
    pub async fn read_identity(&mut self) -> Result<PackageIdentity, ArchiveError> {
        let mut manifests = self.entries.iter().filter(|e| e.is_root_manifest());
        let manifest = match (manifests.next(), manifests.next()) {
            (Some(m), None) => m.clone(),
            (None, _) => {
                return Err(ArchiveError::Manifest("package has no root .nuspec".to_string()))
            }
            (Some(_), Some(_)) => {
                return Err(ArchiveError::Manifest(
                    "package has more than one root .nuspec".to_string(),
                ))
            }
        };

        let mut raw = Vec::new();
        self.reader
            .reader_with_entry(manifest.index)
            .await?
            .read_to_end_checked(&mut raw)
            .await?;

        let text = String::from_utf8(raw)
            .map_err(|_| ArchiveError::Manifest(format!("{} is not utf-8", manifest.path)))?;
        nuspec::parse_identity(text.trim_start_matches('\u{feff}'))
    }

    /// Decompress one entry into an anonymous temp file.
    ///
    /// The decompressed size and CRC-32 must match the central directory.
    pub async fn spool_entry(&mut self, entry: &PackageEntry) -> Result<Spooled, ArchiveError> {
        let (expected_len, expected_crc) = self
            .reader
            .file()
            .entries()
            .get(entry.index)
            .map(|stored| (stored.uncompressed_size(), stored.crc32()))
            .ok_or_else(|| ArchiveError::Parse(format!("no entry at index {}", entry.index)))?;

        let entry_reader = self.reader.reader_with_entry(entry.index).await?;
        let mut stream = Box::pin(entry_reader).compat();
        let spooled = spool_to_temp(&mut stream, None).await?;

        if spooled.len != expected_len {
            return Err(ArchiveError::Parse(format!(
                "{} decompressed to {} bytes, directory says {}",
                entry.path, spooled.len, expected_len
            )));
        }
        if spooled.crc32 != expected_crc {
            return Err(ArchiveError::Parse(format!(
                "{} has crc32 {:08x}, directory says {:08x}",
                entry.path, spooled.crc32, expected_crc
            )));
        }
        Ok(spooled)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{archive, corrupt, nuspec, stored_archive};
    use super::*;
    use crate::pdb::portable_pdb_fixture;
    use tokio::io::AsyncReadExt;

    async fn open(bytes: Vec<u8>) -> Result<SymbolPackage, ArchiveError> {
        SymbolPackage::from_upload(&mut std::io::Cursor::new(bytes), 1024 * 1024).await
    }

    #[tokio::test]
    async fn lists_entries_and_reads_identity() {
        let pdb = portable_pdb_fixture([1; 16]);
        let manifest = nuspec("Foo", "1.0.0");
        let bytes = archive(&[
            ("Foo.nuspec", manifest.as_bytes()),
            ("_rels/.rels", b"<Relationships/>"),
            ("lib/net8.0/Foo.pdb", &pdb),
        ]);

        let mut package = open(bytes).await.unwrap();
        let paths: Vec<_> = package.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["Foo.nuspec", "_rels/.rels", "lib/net8.0/Foo.pdb"]);

        let identity = package.read_identity().await.unwrap();
        assert_eq!(identity, PackageIdentity { id: "Foo".into(), version: "1.0.0".into() });

        let pdbs = package.pdb_entries();
        assert_eq!(pdbs.len(), 1);
        let mut spooled = package.spool_entry(&pdbs[0]).await.unwrap();
        let mut back = Vec::new();
        spooled.file.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, pdb);
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        assert!(matches!(
            open(b"definitely not a zip file".to_vec()).await,
            Err(ArchiveError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let bytes = archive(&[("Foo.pdb", &[0u8; 4096])]);
        let result = SymbolPackage::from_upload(&mut std::io::Cursor::new(bytes), 16).await;
        assert!(matches!(result, Err(ArchiveError::Validation(_))));
    }

    #[tokio::test]
    async fn traversal_entries_are_rejected() {
        let bytes = archive(&[("../../evil.pdb", b"x")]);
        assert!(matches!(open(bytes).await, Err(ArchiveError::Validation(_))));
    }

    #[tokio::test]
    async fn manifest_must_be_unique_and_at_root() {
        let manifest = nuspec("Foo", "1.0.0");

        let nested = archive(&[("sub/Foo.nuspec", manifest.as_bytes())]);
        let mut package = open(nested).await.unwrap();
        assert!(matches!(package.read_identity().await, Err(ArchiveError::Manifest(_))));

        let doubled = archive(&[
            ("Foo.nuspec", manifest.as_bytes()),
            ("Bar.nuspec", manifest.as_bytes()),
        ]);
        let mut package = open(doubled).await.unwrap();
        assert!(matches!(package.read_identity().await, Err(ArchiveError::Manifest(_))));
    }

    #[tokio::test]
    async fn corrupted_entry_fails_crc_check() {
        let pdb = portable_pdb_fixture([2; 16]);
        let manifest = nuspec("Foo", "1.0.0");
        let mut bytes = stored_archive(&[
            ("Foo.nuspec", manifest.as_bytes()),
            ("lib/Foo.pdb", &pdb),
        ]);
        corrupt(&mut bytes, &pdb);

        let mut package = open(bytes).await.unwrap();
        let pdbs = package.pdb_entries();
        let err = package.spool_entry(&pdbs[0]).await.err().unwrap();
        assert!(matches!(err, ArchiveError::Parse(ref msg) if msg.contains("crc32")));
    }
}
