//! Storage layer for persistent settings

use crate::error::DoError;
use dosdk_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const SETTINGS_FILE: &str = "settings.json";

/// Settings persisted as JSON in a data directory
#[derive(Clone, Debug)]
pub struct SettingsStore {
    data_dir: PathBuf,
}

impl SettingsStore {
    /// Open the store, creating the directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self, DoError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    /// Platform data directory, `None` if the platform has none
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("dosdk"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Load settings, falling back to defaults when nothing is saved yet
    pub async fn load_settings(&self) -> Result<Settings, DoError> {
        let path = self.settings_path();
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                Ok(Settings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), DoError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }

    /// Remove saved settings so the defaults apply again
    pub async fn reset_settings(&self) -> Result<(), DoError> {
        match fs::remove_file(self.settings_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_settings_are_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested")).await.unwrap();
        let settings = store.load_settings().await.unwrap();
        assert_eq!(settings.wait_poll_interval_ms, Settings::default().wait_poll_interval_ms);
    }

    #[tokio::test]
    async fn test_settings_round_trip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().to_path_buf()).await.unwrap();

        let mut settings = Settings::default();
        settings.agent.port = Some(50000);
        settings.local.background_limit_bps = 1024;
        store.save_settings(&settings).await.unwrap();

        let loaded = store.load_settings().await.unwrap();
        assert_eq!(loaded.agent.port, Some(50000));
        assert_eq!(loaded.local.background_limit_bps, 1024);

        store.reset_settings().await.unwrap();
        store.reset_settings().await.unwrap();
        assert_eq!(store.load_settings().await.unwrap().agent.port, None);
    }

    #[tokio::test]
    async fn test_corrupt_settings_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().to_path_buf()).await.unwrap();
        tokio::fs::write(store.settings_path(), "{ not json").await.unwrap();
        assert!(matches!(
            store.load_settings().await.unwrap_err(),
            DoError::Serialization(_)
        ));
    }
}
