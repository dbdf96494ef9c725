//! JSON file settings store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lumen_core::errors::StoreError;
use lumen_core::types::ConnectionParams;
use lumen_core::SettingsStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Settings store errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<SettingsError> for StoreError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Io(e) => StoreError::OperationFailed(e.to_string()),
            SettingsError::Corrupt(e) => StoreError::DataCorruption(e.to_string()),
        }
    }
}

/// On-disk settings document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection: Option<ConnectionParams>,
}

/// Settings persisted as a JSON document.
///
/// Writes go to a temporary file that is synced and renamed over the
/// original, so a crash leaves either the old or the new document.
pub struct JsonSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the settings document; a missing file reads as defaults
    pub async fn load(&self) -> Result<Settings, SettingsError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(settings)?;
        let temp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    /// Forget the last connection
    pub async fn clear_last_connection(&self) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.load().await?;
        settings.last_connection = None;
        self.store(&settings).await
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn last_connection(&self) -> Result<Option<ConnectionParams>, StoreError> {
        Ok(self.load().await?.last_connection)
    }

    async fn save_last_connection(&self, params: &ConnectionParams) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.load().await?;
        settings.last_connection = Some(params.clone());
        Ok(self.store(&settings).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_reads_as_default() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(temp_dir.path().join("settings.json"));

        assert_eq!(store.load().await.unwrap(), Settings::default());
        assert_eq!(store.last_connection().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_connection_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");
        let params = ConnectionParams::new("10.0.0.2", 47989, 881448767);

        JsonSettingsStore::new(&path)
            .save_last_connection(&params)
            .await
            .unwrap();

        let reopened = JsonSettingsStore::new(&path);
        assert_eq!(reopened.last_connection().await.unwrap(), Some(params));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_clear_last_connection() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(temp_dir.path().join("settings.json"));
        store
            .save_last_connection(&ConnectionParams::new("pc", 47989, 0))
            .await
            .unwrap();

        store.clear_last_connection().await.unwrap();
        assert_eq!(store.last_connection().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{ broken").unwrap();

        let store = JsonSettingsStore::new(&path);
        assert!(matches!(
            store.last_connection().await,
            Err(StoreError::DataCorruption(_))
        ));
    }
}
