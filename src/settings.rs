//! Runtime settings changed by clients through `/config`

use crate::error::WorkbenchError;
use crate::snapshot::{DEFAULT_TOTAL_PHASES, TOTAL_PHASES_WITH_OS};
use crate::store::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Wait for a link signal and a plugged USB before uploading
    #[serde(default = "default_link")]
    pub link: bool,
    /// Expect the OS install phase
    #[serde(default)]
    pub install_os: bool,
}

fn default_link() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            link: default_link(),
            install_os: false,
        }
    }
}

impl Settings {
    /// Phases a snapshot started now must go through.
    pub fn total_phases(&self) -> u64 {
        if self.install_os {
            TOTAL_PHASES_WITH_OS
        } else {
            DEFAULT_TOTAL_PHASES
        }
    }
}

/// Settings as `GET /config` shows them.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    #[serde(flatten)]
    pub settings: Settings,
    /// OS images available in the images folder
    pub images: Vec<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    images_dir: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    pub async fn load(path: PathBuf, images_dir: PathBuf) -> Result<Self, WorkbenchError> {
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = ?path, error = %e, "Ignoring corrupt settings file");
                Settings::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            images_dir,
            current: RwLock::new(current),
        })
    }

    pub async fn get(&self) -> Settings {
        *self.current.read().await
    }

    pub async fn set(&self, settings: Settings) -> Result<(), WorkbenchError> {
        let mut current = self.current.write().await;
        write_atomic(&self.path, &serde_json::to_vec_pretty(&settings)?).await?;
        *current = settings;
        info!(link = settings.link, install_os = settings.install_os, "Settings updated");
        Ok(())
    }

    pub async fn view(&self) -> Result<SettingsView, WorkbenchError> {
        Ok(SettingsView {
            settings: self.get().await,
            images: self.images().await?,
        })
    }

    async fn images(&self) -> Result<Vec<String>, WorkbenchError> {
        let mut images = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.images_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                images.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        images.sort();
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_then_persisted_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        std::fs::write(images.join("debian.fsa"), b"").unwrap();

        let store = SettingsStore::load(path.clone(), images.clone()).await.unwrap();
        let view = store.view().await.unwrap();
        assert!(view.settings.link);
        assert_eq!(view.settings.total_phases(), 4);
        assert_eq!(view.images, vec!["debian.fsa".to_string()]);

        store
            .set(Settings {
                link: false,
                install_os: true,
            })
            .await
            .unwrap();

        let reloaded = SettingsStore::load(path, images).await.unwrap();
        let settings = reloaded.get().await;
        assert!(!settings.link);
        assert_eq!(settings.total_phases(), 5);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
    }
}
