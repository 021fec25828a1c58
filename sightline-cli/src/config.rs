//! Application configuration storage
//!
//! One JSON file holds the LLM connection, the query backend and the
//! session service settings. Every section is optional.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sightline_collaborators::{LlmConfig, QueryBackendConfig};
use sightline_session_service::SessionServiceConfig;
use tokio::fs;

const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "sightline";

/// Full application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Chat completion server
    pub llm: LlmConfig,
    /// Query execution service
    pub query_backend: QueryBackendConfig,
    /// Run limits and retry policies
    pub service: SessionServiceConfig,
    /// Turns kept per session by the in-memory history store
    pub history_max_turns: Option<usize>,
}

impl AppConfig {
    /// Default location: `<config dir>/sightline/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_file(path).await,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_file(&path).await,
                _ => {
                    log::debug!("No configuration file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration, creating the parent directory if needed.
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::Io(parent.to_path_buf(), e))?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, contents)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        log::info!("Configuration saved to {:?}", path);
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Failed to parse config {0:?}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = AppConfig::default();
        config.llm.base_url = "http://llm.internal:8000".into();
        config.service.history_limit = 3;
        config.save(&path).await.unwrap();

        let loaded = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"queryBackend": {"url": "http://db:9000/query"}}"#)
            .await
            .unwrap();

        let loaded = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.query_backend.url, "http://db:9000/query");
        assert_eq!(loaded.llm, LlmConfig::default());
        assert_eq!(loaded.service, SessionServiceConfig::default());
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("absent.json"))).await.unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{not json").await.unwrap();

        let err = AppConfig::load(Some(&path)).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_, _)));
    }
}
