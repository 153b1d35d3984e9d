use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no configuration directory available")]
    NoConfigDir,
}

/// On-disk server configuration document.
///
/// Every field carries a compiled-in default so documents written by older or
/// newer builds always load: missing keys fall back to the default, unknown
/// keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Instance identity. Offsets the listen port and the per-instance
    /// registry and crash-marker file names so several servers can share a
    /// host.
    #[serde(rename = "ID")]
    pub id: u16,
    #[serde(rename = "CLAP")]
    pub enable_clap: bool,
    #[serde(rename = "VST3")]
    pub enable_vst3: bool,
    #[serde(rename = "LV2")]
    pub enable_lv2: bool,
    /// JPEG quality used when streaming plugin editors.
    #[serde(rename = "ScreenQuality")]
    pub screen_quality: f32,
    #[serde(rename = "ScreenDiffDetection")]
    pub screen_diff_detection: bool,
    /// Plugin names the user chose not to serve. Only names observed by a
    /// discovery pass survive here; stale entries are pruned after each pass.
    #[serde(rename = "ExcludePlugins")]
    pub exclude_plugins: BTreeSet<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            enable_clap: false,
            enable_vst3: false,
            enable_lv2: false,
            screen_quality: 0.9,
            screen_diff_detection: true,
            exclude_plugins: BTreeSet::new(),
        }
    }
}

/// Loads and persists the configuration document at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted document. A missing file is equivalent to "use
    /// defaults" and a malformed file falls back to defaults as well; a load
    /// never fails.
    pub fn load(&self) -> ServerConfig {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "could not read configuration at {}: {}",
                        self.path.display(),
                        err
                    );
                }
                return ServerConfig::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    "malformed configuration at {}: {}",
                    self.path.display(),
                    err
                );
                ServerConfig::default()
            }
        }
    }

    /// Writes the full in-memory configuration, replacing the prior file.
    /// Partial updates are never written.
    pub fn save(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        assert_eq!(store.load(), ServerConfig::default());
    }

    #[test]
    fn partial_document_keeps_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"ID": 2, "VST3": true}"#).unwrap();
        let config = ConfigStore::new(&path).load();
        assert_eq!(config.id, 2);
        assert!(config.enable_vst3);
        assert!(!config.enable_clap);
        assert!(!config.enable_lv2);
        assert_eq!(config.screen_quality, 0.9);
        assert!(config.screen_diff_detection);
        assert!(config.exclude_plugins.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"ID": 1, "FutureSetting": [1, 2, 3]}"#).unwrap();
        let config = ConfigStore::new(&path).load();
        assert_eq!(config.id, 1);
    }

    #[test]
    fn malformed_document_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(ConfigStore::new(&path).load(), ServerConfig::default());
    }

    #[test]
    fn load_save_roundtrip_reproduces_all_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"ID": 2, "VST3": true}"#).unwrap();
        let store = ConfigStore::new(&path);
        let loaded = store.load();
        store.save(&loaded).unwrap();
        assert_eq!(store.load(), loaded);
    }

    #[test]
    fn save_replaces_prior_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path);
        let mut config = ServerConfig::default();
        config.exclude_plugins.insert("Old Plugin".to_string());
        store.save(&config).unwrap();
        config.exclude_plugins.clear();
        config.id = 7;
        store.save(&config).unwrap();
        let reloaded = store.load();
        assert_eq!(reloaded.id, 7);
        assert!(reloaded.exclude_plugins.is_empty());
    }
}
