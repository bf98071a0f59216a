use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::storage::StorageError;

/// Owned byte stream handed to or returned from a storage backend.
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

/// Content to persist: the stream plus its exact length, which blob
/// backends need up front.
pub struct Content {
    pub stream: ContentStream,
    pub len: u64,
}

impl Content {
    pub fn new(stream: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        Self {
            stream: Box::new(stream),
            len,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self::new(std::io::Cursor::new(data), len)
    }
}

/// Create-only object store addressed by symbol keys.
///
/// Implementations must normalize every key with
/// [`normalize_key`](crate::storage::normalize_key) before touching the
/// backend, and must never overwrite: a `save` to an occupied key fails with
/// [`StorageError::Conflict`] whatever the content is. A reader must never
/// observe a partially written object.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn save(&self, key: &str, content: Content) -> Result<(), StorageError>;

    async fn load(&self, key: &str) -> Result<ContentStream, StorageError>;
}
