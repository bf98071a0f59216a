use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use anyhow::Result;

use crate::utils::limits::DEFAULT_MAX_UPLOAD_SIZE;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:5000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Filesystem {
        path: PathBuf,
    },
    AzureBlob {
        account_url: String,
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sas_token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Key required in `X-NuGet-ApiKey`; unset or empty disables the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_upload_size: u64,
    pub registry_path: PathBuf,
    pub auto_create_directories: bool,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            api_key: None,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            registry_path: PathBuf::from("./data/packages.json"),
            auto_create_directories: true,
            storage: StorageConfig::Filesystem {
                path: PathBuf::from("./data/symbols"),
            },
        }
    }
}

impl ServerConfig {
    pub fn load_or_create(config_path: Option<&str>) -> Result<Self> {
        let config_file = config_path.unwrap_or("symstore.toml");

        if std::path::Path::new(config_file).exists() {
            let content = std::fs::read_to_string(config_file)?;
            let config: ServerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(config_file)?;
            tracing::info!("Wrote default config to {}", config_file);
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if !self.auto_create_directories {
            return Ok(());
        }

        if let StorageConfig::Filesystem { path } = &self.storage {
            if !path.exists() {
                std::fs::create_dir_all(path)?;
                tracing::info!("Created symbol directory: {:?}", path);
            }
        }

        if let Some(parent) = self.registry_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created registry directory: {:?}", parent);
            }
        }
        Ok(())
    }
}
