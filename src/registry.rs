//! Package registration lookup.
//!
//! The registry of published packages is owned elsewhere; this module only
//! reads it. [`JsonFileRegistry`] serves a registration list exported to a
//! JSON file, which is what the daemon uses when run standalone.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry data is malformed: {0}")]
    Malformed(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRegistration {
    pub id: String,
    pub version: String,
    #[serde(default = "default_listed")]
    pub listed: bool,
}

fn default_listed() -> bool {
    true
}

#[async_trait]
pub trait PackageRegistry: Send + Sync {
    async fn find_or_null(
        &self,
        id: &str,
        version: &str,
        include_unlisted: bool,
    ) -> Result<Option<PackageRegistration>, RegistryError>;
}

/// Normalize a NuGet version string.
///
/// Build metadata is dropped, one to four numeric parts are padded to
/// `major.minor.patch`, a fourth part survives only when non-zero and the
/// prerelease label is kept as given. Returns `None` for anything that is
/// not a version.
pub fn normalize_version(version: &str) -> Option<String> {
    let version = version.trim();
    let without_metadata = version.split('+').next().unwrap_or_default();
    let (numbers, release) = match without_metadata.split_once('-') {
        Some((n, r)) => (n, Some(r)),
        None => (without_metadata, None),
    };

    let parts = numbers
        .split('.')
        .map(|p| {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                p.parse::<u64>().ok()
            }
        })
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }

    let part = |i: usize| parts.get(i).copied().unwrap_or(0);
    let mut normalized = format!("{}.{}.{}", part(0), part(1), part(2));
    if part(3) != 0 {
        normalized.push_str(&format!(".{}", part(3)));
    }

    if let Some(release) = release {
        let valid = !release.is_empty()
            && release.split('.').all(|label| {
                !label.is_empty()
                    && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            });
        if !valid {
            return None;
        }
        normalized.push('-');
        normalized.push_str(release);
    }

    Some(normalized)
}

fn lookup_key(id: &str, version: &str) -> Option<(String, String)> {
    let version = normalize_version(version)?;
    Some((id.to_lowercase(), version.to_lowercase()))
}

/// Registrations loaded once from a JSON array of
/// `{ "id": .., "version": .., "listed": .. }`.
#[derive(Debug, Default)]
pub struct JsonFileRegistry {
    packages: HashMap<(String, String), PackageRegistration>,
}

impl JsonFileRegistry {
    pub fn new(
        registrations: impl IntoIterator<Item = PackageRegistration>,
    ) -> Result<Self, RegistryError> {
        let mut packages = HashMap::new();
        for mut registration in registrations {
            let key = lookup_key(&registration.id, &registration.version).ok_or_else(|| {
                RegistryError::Malformed(format!(
                    "{} has invalid version {:?}",
                    registration.id, registration.version
                ))
            })?;
            registration.version = normalize_version(&registration.version).unwrap_or_default();
            packages.insert(key, registration);
        }
        Ok(Self { packages })
    }

    /// Load from `path`; a missing file is an empty registry.
    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let data = match tokio::fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Registry file {:?} not found, starting empty", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let registrations: Vec<PackageRegistration> =
            serde_json::from_slice(&data).map_err(|e| RegistryError::Malformed(e.to_string()))?;
        Self::new(registrations)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[async_trait]
impl PackageRegistry for JsonFileRegistry {
    async fn find_or_null(
        &self,
        id: &str,
        version: &str,
        include_unlisted: bool,
    ) -> Result<Option<PackageRegistration>, RegistryError> {
        let Some(key) = lookup_key(id, version) else {
            return Ok(None);
        };
        Ok(self
            .packages
            .get(&key)
            .filter(|p| include_unlisted || p.listed)
            .cloned())
    }
}

/// Answers whether a symbol package has a matching published package.
#[derive(Clone)]
pub struct PackageExistenceGate {
    registry: Arc<dyn PackageRegistry>,
}

impl PackageExistenceGate {
    pub fn new(registry: Arc<dyn PackageRegistry>) -> Self {
        Self { registry }
    }

    /// Unlisted packages count as existing. Registry failures are returned,
    /// never folded into `false`.
    pub async fn exists(&self, id: &str, version: &str) -> Result<bool, RegistryError> {
        Ok(self.registry.find_or_null(id, version, true).await?.is_some())
    }
}
