use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use audio_upload_server::audio::{
    AudioProbe, AudioUploadService, FfmpegTranscoder, FfprobeProbe, FileHandler,
};
use audio_upload_server::config::{AppConfig, CliConfig, FileConfig};
use audio_upload_server::server::{run_server, RequestsLoggingLevel, ServerConfig};
use audio_upload_server::storage::{AudioStore, BlobAudioStore, StorageBackend};

/// Headroom on top of the upload limit for multipart framing and the metadata field.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Directory for scoped temporary files.
    #[clap(long)]
    pub temp_dir: Option<PathBuf>,

    /// Command line used to run ffmpeg.
    #[clap(long, env = "FFMPEG_COMMAND", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Command line used to run ffprobe.
    #[clap(long, env = "FFPROBE_COMMAND", default_value = "ffprobe")]
    pub ffprobe: String,

    /// Timeout in seconds for each ffmpeg/ffprobe invocation.
    #[clap(long, default_value_t = 120)]
    pub command_timeout_secs: u64,

    /// Lifetime in hours of issued read URLs (1 to 168).
    #[clap(long, env = "SAS_EXPIRE_HOURS", default_value_t = 1)]
    pub sas_expire_hours: u64,

    /// Where recordings are stored.
    #[clap(long, env = "STORAGE_BACKEND", default_value = "azure")]
    pub storage_backend: StorageBackend,

    #[clap(long, env = "AZURE_STORAGE_ACCOUNT_NAME")]
    pub storage_account_name: Option<String>,

    #[clap(long, env = "AZURE_STORAGE_ACCOUNT_KEY", hide_env_values = true)]
    pub storage_account_key: Option<String>,

    #[clap(long, env = "AZURE_STORAGE_CONTAINER_NAME", default_value = "audio")]
    pub storage_container: String,

    /// Talk to a local storage emulator instead of Azure.
    #[clap(long, env = "AZURE_STORAGE_USE_EMULATOR")]
    pub storage_use_emulator: bool,

    /// Blob service account URL, overriding the one derived from the account name.
    #[clap(long, env = "AZURE_STORAGE_ENDPOINT")]
    pub storage_endpoint: Option<String>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            port: self.port,
            logging_level: self.logging_level.clone(),
            temp_dir: self.temp_dir.clone(),
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            command_timeout_secs: self.command_timeout_secs,
            sas_expire_hours: self.sas_expire_hours,
            storage_backend: self.storage_backend,
            storage_account_name: self.storage_account_name.clone(),
            storage_account_key: self.storage_account_key.clone(),
            storage_container: self.storage_container.clone(),
            storage_use_emulator: self.storage_use_emulator,
            storage_endpoint: self.storage_endpoint.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!(
        "Starting audio-upload-server {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let files = FileHandler::new(config.temp_dir.clone());
    files
        .init()
        .await
        .with_context(|| format!("Failed to create temp dir {:?}", config.temp_dir))?;
    info!("Using temp dir {:?}", files.temp_dir());

    let probe: Arc<dyn AudioProbe> = Arc::new(FfprobeProbe::new(
        config.media.ffprobe.clone(),
        files.clone(),
        config.media.command_timeout,
    ));
    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.media.ffmpeg.clone(),
        probe.clone(),
        files,
        config.media.command_timeout,
    ));

    info!(
        "Connecting to {} storage, container '{}'...",
        config.storage.backend, config.storage.container
    );
    let store = BlobAudioStore::connect(&config.storage)
        .await
        .context("Failed to initialize audio storage")?;
    info!(
        "Storage ready: backend={} container={}",
        store.backend(),
        store.container()
    );

    let upload_service = Arc::new(AudioUploadService::new(
        probe,
        transcoder,
        Arc::new(store),
        config.upload.clone(),
    ));

    let server_config = ServerConfig {
        requests_logging_level: config.logging_level.clone(),
        port: config.port,
        max_body_bytes: usize::try_from(config.upload.max_upload_bytes + MULTIPART_OVERHEAD_BYTES)
            .context("Upload limit does not fit in memory")?,
    };

    info!("Ready to serve at port {}!", config.port);
    run_server(server_config, upload_service, env!("GIT_HASH").to_string()).await
}
