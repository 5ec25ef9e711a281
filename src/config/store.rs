use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; writes go to disk first and then
/// replace the cached snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, loading `path` or falling back to defaults when the
    /// file does not exist yet.
    pub async fn new(path: &Path) -> Result<Self> {
        let config = Self::load_config(path).await?;
        let (change_tx, _) = broadcast::channel(16);
        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                debug!("Loaded configuration from {}", path.display());
                serde_json::from_str(&json)
                    .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using defaults", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(config)?;
        // write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    pub async fn set(&self, config: AppConfig) -> Result<()> {
        self.save_config(&config).await?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
        Ok(())
    }

    /// Read-modify-write; the last concurrent writer wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.set(config).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("maix-video.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert_eq!(store.get().recorder.fps, 30);
        assert!(!path.exists());

        let mut rx = store.subscribe();
        store
            .update(|c| {
                c.recorder.fps = 25;
                c.recorder.resolution = Some(Resolution::HD720);
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().key, "app_config");
        assert_eq!(store.get().recorder.fps, 25);

        let reopened = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reopened.get().recorder.fps, 25);
        assert_eq!(reopened.get().recorder.resolution, Some(Resolution::HD720));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let result = tokio_test::block_on(ConfigStore::new(&path));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
