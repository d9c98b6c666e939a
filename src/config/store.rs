use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by an optional JSON file
///
/// The relay reads its configuration once at startup; the store keeps the
/// parsed value behind an `Arc` so handlers can share it without cloning.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: Arc<AppConfig>,
}

impl ConfigStore {
    /// Load configuration from `path`, or use defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str::<AppConfig>(&raw)?
            }
            None => AppConfig::default(),
        };

        Ok(Self {
            path: path.map(Path::to_path_buf),
            config: Arc::new(config),
        })
    }

    /// Build a store around an already assembled configuration
    pub fn from_config(config: AppConfig) -> Self {
        Self {
            path: None,
            config: Arc::new(config),
        }
    }

    /// Get the current configuration
    pub fn get(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Apply an in-place edit (used for CLI overrides before startup)
    pub fn update<F>(&mut self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.config).clone();
        f(&mut config);
        self.config = Arc::new(config);
    }

    /// File the configuration was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
