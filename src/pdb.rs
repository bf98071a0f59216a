//! Portable PDB signature parsing and SSQP key derivation.
//!
//! A portable PDB starts with an ECMA-335 metadata root:
//!
//! ```text
//! u32  signature  "BSJB"
//! u16  major, u16 minor, u32 reserved
//! u32  version length (padded to 4), version string
//! u16  flags, u16 stream count
//! per stream: u32 offset, u32 size, NUL-terminated name padded to 4
//! ```
//!
//! The `#Pdb` stream begins with the 20-byte PDB id whose first 16 bytes are
//! the GUID clients put in their symbol server queries.

use std::fmt;
use std::io::SeekFrom;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// "BSJB", little endian.
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Age component of portable PDB keys; portable PDBs carry no age.
pub const PORTABLE_PDB_AGE: &str = "FFFFFFFF";

const PDB_STREAM_NAME: &str = "#Pdb";
const PDB_ID_SIZE: usize = 20;
const MAX_VERSION_LENGTH: u32 = 255;
const MAX_STREAM_NAME: usize = 32;
const MAX_STREAMS: u16 = 64;

#[derive(Debug, Error)]
pub enum DebugFileError {
    #[error("invalid debug file: {0}")]
    InvalidDebugFile(String),

    #[error("failed to read debug file: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(msg: impl Into<String>) -> DebugFileError {
    DebugFileError::InvalidDebugFile(msg.into())
}

/// The 128-bit content signature of a portable PDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdbSignature(pub [u8; 16]);

impl PdbSignature {
    /// Lowercase 32 digit hex in GUID field order: the first three fields
    /// are little-endian on disk and printed big-endian.
    pub fn to_guid_hex(&self) -> String {
        let b = &self.0;
        let ordered = [
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15],
        ];
        hex::encode(ordered)
    }
}

impl fmt::Display for PdbSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_guid_hex())
    }
}

/// SSQP key of a stored debug file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey(String);

impl SymbolKey {
    /// `<file>/<signature><age>/<file>` with the file name lowercased.
    pub fn portable_pdb(file_name: &str, signature: &PdbSignature) -> Self {
        let file_name = file_name.to_lowercase();
        Self(format!(
            "{}/{}{}/{}",
            file_name,
            signature.to_guid_hex(),
            PORTABLE_PDB_AGE,
            file_name
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `.pdb` entry of a symbol package, once its key has been derived.
#[derive(Debug, Clone)]
pub struct DebugFile {
    pub path: String,
    pub signature: PdbSignature,
    pub key: SymbolKey,
}

/// Last segment of an archive path.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Parse the portable PDB in `reader` and derive its SSQP key.
///
/// `path` is the entry path inside the package; only its file name is used.
/// The reader is left at an unspecified position.
pub async fn derive_key<R>(path: &str, reader: &mut R) -> Result<DebugFile, DebugFileError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let name = file_name(path);
    if name.is_empty() {
        return Err(invalid(format!("{} has no file name", path)));
    }

    let signature = read_signature(reader).await?;
    Ok(DebugFile {
        path: path.to_string(),
        signature,
        key: SymbolKey::portable_pdb(name, &signature),
    })
}

/// Read the PDB id GUID out of the `#Pdb` metadata stream.
pub async fn read_signature<R>(reader: &mut R) -> Result<PdbSignature, DebugFileError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let total_len = reader.seek(SeekFrom::End(0)).await?;
    reader.seek(SeekFrom::Start(0)).await?;

    let mut header = [0u8; 16];
    read_or_invalid(reader, &mut header, "metadata root header").await?;

    let signature = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if signature != METADATA_SIGNATURE {
        return Err(invalid(format!("bad metadata signature {:#010x}", signature)));
    }

    let version_len = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    if version_len == 0 || version_len > MAX_VERSION_LENGTH + 1 || version_len % 4 != 0 {
        return Err(invalid(format!("bad version length {}", version_len)));
    }
    let mut version = vec![0u8; version_len as usize];
    read_or_invalid(reader, &mut version, "metadata version").await?;

    let mut counts = [0u8; 4];
    read_or_invalid(reader, &mut counts, "stream count").await?;
    let stream_count = u16::from_le_bytes([counts[2], counts[3]]);
    if stream_count > MAX_STREAMS {
        return Err(invalid(format!("too many metadata streams: {}", stream_count)));
    }

    let mut pdb_stream = None;
    for _ in 0..stream_count {
        let mut location = [0u8; 8];
        read_or_invalid(reader, &mut location, "stream header").await?;
        let offset = u32::from_le_bytes([location[0], location[1], location[2], location[3]]);
        let size = u32::from_le_bytes([location[4], location[5], location[6], location[7]]);
        let name = read_stream_name(reader).await?;

        if u64::from(offset) + u64::from(size) > total_len {
            return Err(invalid(format!("stream {} exceeds file bounds", name)));
        }
        if name == PDB_STREAM_NAME && pdb_stream.is_none() {
            pdb_stream = Some((offset, size));
        }
    }

    let (offset, size) = pdb_stream.ok_or_else(|| invalid("no #Pdb stream; not a portable PDB"))?;
    if (size as usize) < PDB_ID_SIZE {
        return Err(invalid(format!("#Pdb stream too small: {} bytes", size)));
    }

    reader.seek(SeekFrom::Start(u64::from(offset))).await?;
    let mut id = [0u8; 16];
    read_or_invalid(reader, &mut id, "#Pdb id").await?;

    Ok(PdbSignature(id))
}

/// Stream names are NUL-terminated and padded to a 4-byte boundary.
async fn read_stream_name<R>(reader: &mut R) -> Result<String, DebugFileError>
where
    R: AsyncRead + Unpin,
{
    let mut name = Vec::new();
    loop {
        let mut chunk = [0u8; 4];
        read_or_invalid(reader, &mut chunk, "stream name").await?;
        if let Some(nul) = chunk.iter().position(|b| *b == 0) {
            name.extend_from_slice(&chunk[..nul]);
            break;
        }
        name.extend_from_slice(&chunk);
        if name.len() >= MAX_STREAM_NAME {
            return Err(invalid("unterminated stream name"));
        }
    }
    String::from_utf8(name).map_err(|_| invalid("stream name is not ASCII"))
}

async fn read_or_invalid<R>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), DebugFileError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(invalid(format!("truncated {}", what)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Minimal portable PDB image with the given GUID bytes, for tests.
#[cfg(test)]
pub(crate) fn portable_pdb_fixture(guid: [u8; 16]) -> Vec<u8> {
    let version = b"PDB v1.0\0\0\0\0";
    let mut out = Vec::new();
    out.extend_from_slice(&METADATA_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(version.len() as u32).to_le_bytes());
    out.extend_from_slice(version);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());

    // One stream header: 8 bytes of location plus "#Pdb\0" padded to 8.
    let stream_offset = (out.len() + 16) as u32;
    out.extend_from_slice(&stream_offset.to_le_bytes());
    out.extend_from_slice(&32u32.to_le_bytes());
    out.extend_from_slice(b"#Pdb\0\0\0\0");

    out.extend_from_slice(&guid);
    out.extend_from_slice(&0x1234_5678u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out
}
