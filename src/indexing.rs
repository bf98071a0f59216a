//! Symbol package indexing pipeline.
//!
//! `Received -> Validated -> PackageMatched -> FilesStored -> Success`, with
//! every stage returning a typed error. Errors are turned into a
//! [`SymbolIndexingResult`] in one place, [`SymbolIndexingService::index`].

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{validate_entries, ArchiveError, PackageEntry, SymbolPackage};
use crate::metrics::MetricsCollector;
use crate::pdb::{self, DebugFileError};
use crate::registry::{PackageExistenceGate, PackageRegistry, RegistryError};
use crate::storage::{Content, StorageEngine, StorageError};
use crate::utils::io::sha256_stream;
use crate::utils::limits::DEFAULT_MAX_UPLOAD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolIndexingResult {
    Success,
    InvalidSymbolPackage,
    PackageNotFound,
    Cancelled,
    InternalError,
}

#[derive(Debug, Error)]
enum IndexingError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("{path}: {source}")]
    DebugFile {
        path: String,
        #[source]
        source: DebugFileError,
    },

    #[error("package {id} {version} is not registered")]
    PackageNotFound { id: String, version: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{key} is already stored with different content")]
    StorageConflict { key: String },

    #[error("storing {key} failed: {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("indexing cancelled")]
    Cancelled,
}

impl IndexingError {
    fn outcome(&self) -> SymbolIndexingResult {
        match self {
            IndexingError::Archive(_)
            | IndexingError::DebugFile { .. }
            | IndexingError::StorageConflict { .. }
            | IndexingError::Storage { .. } => SymbolIndexingResult::InvalidSymbolPackage,
            IndexingError::PackageNotFound { .. } => SymbolIndexingResult::PackageNotFound,
            IndexingError::Registry(_) => SymbolIndexingResult::InternalError,
            IndexingError::Cancelled => SymbolIndexingResult::Cancelled,
        }
    }
}

pub struct SymbolIndexingService {
    gate: PackageExistenceGate,
    storage: Arc<dyn StorageEngine>,
    metrics: Arc<MetricsCollector>,
    max_upload_size: u64,
}

impl SymbolIndexingService {
    pub fn new(
        registry: Arc<dyn PackageRegistry>,
        storage: Arc<dyn StorageEngine>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            gate: PackageExistenceGate::new(registry),
            storage,
            metrics,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }

    pub fn with_max_upload_size(mut self, max_upload_size: u64) -> Self {
        self.max_upload_size = max_upload_size;
        self
    }

    /// Index one uploaded symbol package.
    ///
    /// Cancelling `cancel` drops the in-flight stage, releasing its temp
    /// files; `.pdb` files stored before that point stay stored.
    pub async fn index<R>(
        &self,
        upload: &mut R,
        cancel: &CancellationToken,
    ) -> SymbolIndexingResult
    where
        R: AsyncRead + Send + Unpin,
    {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IndexingError::Cancelled),
            r = self.try_index(upload) => r,
        };

        let outcome = match result {
            Ok(()) => SymbolIndexingResult::Success,
            Err(e) => {
                let outcome = e.outcome();
                match outcome {
                    SymbolIndexingResult::InternalError => {
                        error!("Unable to index symbol package: {:?}", e)
                    }
                    SymbolIndexingResult::Cancelled => warn!("Symbol package indexing cancelled"),
                    _ => warn!("Rejected symbol package: {}", e),
                }
                outcome
            }
        };

        self.metrics.record_outcome(outcome);
        outcome
    }

    async fn try_index<R>(&self, upload: &mut R) -> Result<(), IndexingError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut package = SymbolPackage::from_upload(upload, self.max_upload_size).await?;
        debug!("Received symbol package with {} entries", package.entries().len());

        validate_entries(package.entries()).map_err(ArchiveError::Validation)?;

        let identity = package.read_identity().await?;
        if !self.gate.exists(&identity.id, &identity.version).await? {
            return Err(IndexingError::PackageNotFound {
                id: identity.id,
                version: identity.version,
            });
        }
        debug!("Matched package {} {}", identity.id, identity.version);

        let pdbs = package.pdb_entries();
        for entry in &pdbs {
            self.store_pdb(&mut package, entry).await?;
        }

        info!(
            "Indexed symbols for {} {} ({} pdb files)",
            identity.id,
            identity.version,
            pdbs.len()
        );
        Ok(())
    }

    async fn store_pdb(
        &self,
        package: &mut SymbolPackage,
        entry: &PackageEntry,
    ) -> Result<(), IndexingError> {
        let mut spooled = package.spool_entry(entry).await?;

        let debug_file = pdb::derive_key(&entry.path, &mut spooled.file)
            .await
            .map_err(|source| IndexingError::DebugFile {
                path: entry.path.clone(),
                source,
            })?;
        spooled.file.rewind().await.map_err(ArchiveError::Io)?;
        debug!("{} has pdb signature {}", debug_file.path, debug_file.signature);

        let key = debug_file.key.to_string();
        let (len, digest) = (spooled.len, spooled.sha256);
        let storage_error = |source| IndexingError::Storage {
            key: key.clone(),
            source,
        };

        match self.storage.save(&key, Content::new(spooled.file, len)).await {
            Ok(()) => {
                self.metrics.record_pdb_stored(len);
                info!("Stored {} as {}", entry.path, key);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                let mut existing = self.storage.load(&key).await.map_err(storage_error)?;
                let existing_digest = sha256_stream(&mut existing)
                    .await
                    .map_err(|e| storage_error(StorageError::Io(e)))?;

                if existing_digest != digest {
                    return Err(IndexingError::StorageConflict { key: key.clone() });
                }
                self.metrics.record_pdb_already_present();
                debug!("{} already stored with identical content", key);
                Ok(())
            }
            Err(e) => Err(storage_error(e)),
        }
    }
}
