//! Startup configuration resolved from CLI arguments, environment and an optional TOML file.

mod file_config;

pub use file_config::{FileConfig, MediaConfig, StorageConfig};

use crate::audio::{AudioUploadServiceConfig, ToolCommand, DEFAULT_COMMAND_TIMEOUT};
use crate::server::RequestsLoggingLevel;
use crate::storage::{StorageBackend, StorageSettings, MAX_SAS_TTL};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_CONTAINER: &str = "audio";
pub const DEFAULT_SAS_EXPIRE_HOURS: u64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub temp_dir: Option<PathBuf>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub command_timeout_secs: u64,
    pub sas_expire_hours: u64,
    pub storage_backend: StorageBackend,
    pub storage_account_name: Option<String>,
    pub storage_account_key: Option<String>,
    pub storage_container: String,
    pub storage_use_emulator: bool,
    pub storage_endpoint: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            logging_level: RequestsLoggingLevel::default(),
            temp_dir: None,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            sas_expire_hours: DEFAULT_SAS_EXPIRE_HOURS,
            storage_backend: StorageBackend::Azure,
            storage_account_name: None,
            storage_account_key: None,
            storage_container: DEFAULT_CONTAINER.to_string(),
            storage_use_emulator: false,
            storage_endpoint: None,
        }
    }
}

/// External media tools.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub ffmpeg: ToolCommand,
    pub ffprobe: ToolCommand,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub temp_dir: PathBuf,
    pub media: MediaSettings,
    pub storage: StorageSettings,
    pub upload: AudioUploadServiceConfig,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file_config.unwrap_or_default();

        let port = file.port.unwrap_or(cli.port);

        let logging_level = match file.logging_level {
            Some(level) => parse_logging_level(&level).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown logging_level '{}'", level))
            })?,
            None => cli.logging_level.clone(),
        };

        let temp_dir = file
            .temp_dir
            .map(PathBuf::from)
            .or_else(|| cli.temp_dir.clone())
            .unwrap_or_else(|| std::env::temp_dir().join("audio-upload"));

        // Media tools
        let media_file = file.media.unwrap_or_default();
        let ffmpeg = parse_tool(media_file.ffmpeg.as_deref().unwrap_or(&cli.ffmpeg), "ffmpeg")?;
        let ffprobe = parse_tool(
            media_file.ffprobe.as_deref().unwrap_or(&cli.ffprobe),
            "ffprobe",
        )?;
        let command_timeout_secs = media_file
            .command_timeout_secs
            .unwrap_or(cli.command_timeout_secs);
        if command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }

        // Storage
        let storage_file = file.storage.unwrap_or_default();
        let backend = storage_file.backend.unwrap_or(cli.storage_backend);
        let account_name = non_blank(storage_file.account_name)
            .or_else(|| non_blank(cli.storage_account_name.clone()));
        let account_key = non_blank(storage_file.account_key)
            .or_else(|| non_blank(cli.storage_account_key.clone()));
        let container = storage_file
            .container
            .unwrap_or_else(|| cli.storage_container.clone());
        if container.trim().is_empty() {
            return Err(ConfigError::Invalid("container name is empty".to_string()));
        }
        if backend == StorageBackend::Azure && (account_name.is_none() || account_key.is_none()) {
            return Err(ConfigError::Invalid(
                "AZURE_STORAGE_ACCOUNT_NAME and AZURE_STORAGE_ACCOUNT_KEY are required for the azure backend"
                    .to_string(),
            ));
        }
        let use_emulator = storage_file
            .use_emulator
            .unwrap_or(cli.storage_use_emulator);
        let endpoint = non_blank(storage_file.endpoint)
            .or_else(|| non_blank(cli.storage_endpoint.clone()))
            .map(|e| e.trim().trim_end_matches('/').to_string());
        if let Some(endpoint) = &endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "storage endpoint must be an http(s) URL, got '{}'",
                    endpoint
                )));
            }
        }

        let sas_expire_hours = storage_file
            .sas_expire_hours
            .unwrap_or(cli.sas_expire_hours);
        let max_hours = MAX_SAS_TTL.as_secs() / 3600;
        if !(1..=max_hours).contains(&sas_expire_hours) {
            return Err(ConfigError::Invalid(format!(
                "sas_expire_hours must be between 1 and {}, got {}",
                max_hours, sas_expire_hours
            )));
        }

        Ok(Self {
            port,
            logging_level,
            temp_dir,
            media: MediaSettings {
                ffmpeg,
                ffprobe,
                command_timeout: Duration::from_secs(command_timeout_secs),
            },
            storage: StorageSettings {
                backend,
                account_name,
                account_key,
                container,
                use_emulator,
                endpoint,
            },
            upload: AudioUploadServiceConfig {
                sas_ttl: Duration::from_secs(sas_expire_hours * 3600),
                ..Default::default()
            },
        })
    }
}

fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

fn parse_tool(command_line: &str, name: &str) -> Result<ToolCommand, ConfigError> {
    ToolCommand::parse(command_line)
        .map_err(|e| ConfigError::Invalid(format!("{} command: {}", name, e)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
