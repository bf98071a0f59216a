use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::utils::limits::COPY_BUFFER_SIZE;

/// A stream copied into an anonymous temp file, rewound to the start.
///
/// The file has no name on disk and disappears when dropped.
pub struct Spooled {
    pub file: File,
    pub len: u64,
    pub sha256: [u8; 32],
    /// ZIP-style CRC-32 of the copied bytes.
    pub crc32: u32,
}

/// Copy `reader` into an anonymous temp file while hashing it.
///
/// Fails with `InvalidData` once more than `limit` bytes have been read.
pub async fn spool_to_temp<R>(reader: &mut R, limit: Option<u64>) -> std::io::Result<Spooled>
where
    R: AsyncRead + Unpin,
{
    let std_file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(std::io::Error::other)??;
    let mut file = File::from_std(std_file);

    let mut hasher = Sha256::new();
    let mut crc = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut len = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        len += n as u64;
        if limit.is_some_and(|max| len > max) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("stream exceeds {} bytes", limit.unwrap_or_default()),
            ));
        }
        hasher.update(&buf[..n]);
        crc.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    file.rewind().await?;

    Ok(Spooled {
        file,
        len,
        sha256: hasher.finalize().into(),
        crc32: crc.finalize(),
    })
}

/// SHA-256 of everything `reader` yields.
pub async fn sha256_stream<R>(reader: &mut R) -> std::io::Result<[u8; 32]>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spools_and_rewinds() {
        let mut input = std::io::Cursor::new(b"hello symbols".to_vec());
        let mut spooled = spool_to_temp(&mut input, None).await.unwrap();
        assert_eq!(spooled.len, 13);

        let mut back = Vec::new();
        spooled.file.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"hello symbols");

        let digest = sha256_stream(&mut std::io::Cursor::new(back)).await.unwrap();
        assert_eq!(digest, spooled.sha256);
        assert_eq!(spooled.crc32, crc32fast::hash(b"hello symbols"));
    }

    #[tokio::test]
    async fn enforces_limit() {
        let mut input = std::io::Cursor::new(vec![7u8; 100]);
        let err = spool_to_temp(&mut input, Some(99)).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let mut input = std::io::Cursor::new(vec![7u8; 100]);
        assert!(spool_to_temp(&mut input, Some(100)).await.is_ok());
    }
}
