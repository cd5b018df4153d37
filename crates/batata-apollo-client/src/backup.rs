//! Local backup snapshots of namespace records
//!
//! The last known-good record of each namespace is written to disk after a
//! successful fetch and read back when the config service cannot be reached
//! before the namespace was ever loaded.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::model::ApolloConfig;

/// Durable storage for full namespace records.
#[async_trait]
pub trait BackupStore: Send + Sync + 'static {
    /// Overwrite the snapshot of `config.namespace_name`.
    async fn save(&self, config: &ApolloConfig) -> Result<()>;

    /// Read the snapshot of `namespace`, `None` when there is none.
    async fn load(&self, namespace: &str) -> Result<Option<ApolloConfig>>;
}

/// One JSON file per namespace under a base directory
pub struct FileBackupStore {
    base_path: PathBuf,
}

impl FileBackupStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Snapshot file of a namespace
    pub fn file_path(&self, namespace: &str) -> PathBuf {
        let file_name: String = namespace
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.base_path.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    async fn save(&self, config: &ApolloConfig) -> Result<()> {
        let file = self.file_path(&config.namespace_name);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec(config).map_err(|e| ClientError::ParseFailure {
            namespace: config.namespace_name.clone(),
            source: e,
        })?;
        tokio::fs::write(&file, content).await?;

        debug!(
            namespace = %config.namespace_name,
            "Saved backup snapshot to {}",
            file.display()
        );
        Ok(())
    }

    async fn load(&self, namespace: &str) -> Result<Option<ApolloConfig>> {
        let file = self.file_path(namespace);
        let content = match tokio::fs::read(&file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let config =
            serde_json::from_slice(&content).map_err(|e| ClientError::ParseFailure {
                namespace: namespace.to_string(),
                source: e,
            })?;
        Ok(Some(config))
    }
}
