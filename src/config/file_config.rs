//! TOML config file layout.

use serde::Deserialize;
use std::path::Path;

use super::ConfigError;
use crate::storage::StorageBackend;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub port: Option<u16>,
    pub logging_level: Option<String>,
    pub temp_dir: Option<String>,

    pub media: Option<MediaConfig>,
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MediaConfig {
    /// Command line used to run ffmpeg, e.g. "nice -n 10 ffmpeg".
    pub ffmpeg: Option<String>,
    pub ffprobe: Option<String>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Option<StorageBackend>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub container: Option<String>,
    pub use_emulator: Option<bool>,
    /// Account URL override, e.g. "http://azurite:10000/devstoreaccount1".
    pub endpoint: Option<String>,
    pub sas_expire_hours: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
