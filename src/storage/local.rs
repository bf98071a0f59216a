use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::storage::key::{normalize_key, segments};
use crate::storage::{Content, ContentStream, StorageEngine, StorageError};

/// Filesystem-backed symbol store.
///
/// Objects live under `<root>/files/<key>`. Writes are staged in
/// `<root>/staging` and published with a no-clobber rename, so an object is
/// either absent or complete.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, normalized: &str) -> PathBuf {
        let mut path = self.root.join("files");
        path.extend(segments(normalized));
        path
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Backend(format!("blocking task failed: {}", e))
}

#[async_trait::async_trait]
impl StorageEngine for LocalStorage {
    async fn save(&self, key: &str, mut content: Content) -> Result<(), StorageError> {
        let normalized = normalize_key(key)?;
        let path = self.data_path(&normalized);

        if fs::try_exists(&path).await? {
            return Err(StorageError::Conflict(normalized));
        }

        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(staging))
            .await
            .map_err(join_error)??;
        // The staged file is unlinked when `temp_path` drops, including when
        // this future is cancelled mid-copy.
        let (std_file, temp_path) = temp.into_parts();

        let mut file = fs::File::from_std(std_file);
        let copied = tokio::io::copy(&mut content.stream, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if copied != content.len {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {} bytes, stream yielded {}", content.len, copied),
            )));
        }

        let target = path.clone();
        let published = tokio::task::spawn_blocking(move || temp_path.persist_noclobber(&target))
            .await
            .map_err(join_error)?;

        match published {
            Ok(()) => {
                debug!("Stored {} ({} bytes) at {:?}", normalized, copied, path);
                Ok(())
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::Conflict(normalized))
            }
            Err(e) => Err(StorageError::Io(e.error)),
        }
    }

    async fn load(&self, key: &str) -> Result<ContentStream, StorageError> {
        let normalized = normalize_key(key)?;
        let path = self.data_path(&normalized);

        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(normalized));
            }
            Err(e) => return Err(e.into()),
        };

        if !file.metadata().await?.is_file() {
            return Err(StorageError::NotFound(normalized));
        }

        Ok(Box::new(file))
    }
}
