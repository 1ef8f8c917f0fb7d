//! Stream validation with ffprobe.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::command::{CommandError, ToolCommand};
use super::file_handler::FileHandler;
use super::models::{StreamInfo, StreamProbeResult};

/// Errors for uploads that cannot be accepted as audio.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("empty audio payload")]
    EmptyPayload,

    #[error("file size ({0} bytes) exceeds maximum limit ({1} bytes)")]
    FileTooLarge(u64, u64),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    /// ffprobe hung; says nothing about the upload itself.
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("no audio stream")]
    NoAudioStream,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inspects audio bytes and confirms they carry at least one audio stream.
#[async_trait]
pub trait AudioProbe: Send + Sync {
    /// Probe a file that is already on local disk.
    async fn probe_file(&self, path: &Path) -> Result<StreamProbeResult, ValidationError>;

    /// Probe raw bytes declared to be in `declared_format`.
    async fn probe(
        &self,
        data: &[u8],
        declared_format: &str,
    ) -> Result<StreamProbeResult, ValidationError>;
}

/// [`AudioProbe`] backed by the ffprobe CLI.
pub struct FfprobeProbe {
    ffprobe: ToolCommand,
    files: FileHandler,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(ffprobe: ToolCommand, files: FileHandler, timeout: Duration) -> Self {
        Self {
            ffprobe,
            files,
            timeout,
        }
    }
}

#[async_trait]
impl AudioProbe for FfprobeProbe {
    async fn probe_file(&self, path: &Path) -> Result<StreamProbeResult, ValidationError> {
        let output = self
            .ffprobe
            .invocation(self.timeout)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path.to_string_lossy())
            .run()
            .await
            .map_err(|e| match e {
                CommandError::Timeout { timeout, .. } => ValidationError::ProbeTimeout(timeout),
                other => ValidationError::ProbeFailed(other.to_string()),
            })?;

        if !output.success() {
            return Err(ValidationError::ProbeFailed(format!(
                "ffprobe exited with {}: {}",
                output.status,
                output.combined_output()
            )));
        }

        let result = parse_probe_output(&output.stdout)?;
        for stream in result.audio_streams() {
            debug!(
                "Probed audio stream: codec={:?} duration={:?} sample_rate={:?} channels={:?}",
                stream.codec_name, stream.duration, stream.sample_rate, stream.channels
            );
        }
        Ok(result)
    }

    async fn probe(
        &self,
        data: &[u8],
        declared_format: &str,
    ) -> Result<StreamProbeResult, ValidationError> {
        if data.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        // Removed when `file` goes out of scope, whatever the outcome.
        let file = self.files.write_temp(data, declared_format).await?;
        self.probe_file(file.path()).await
    }
}

/// ffprobe JSON output structure.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    duration: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
}

/// Turn ffprobe's JSON into a [`StreamProbeResult`], requiring an audio stream.
pub fn parse_probe_output(stdout: &[u8]) -> Result<StreamProbeResult, ValidationError> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| ValidationError::ProbeFailed(format!("JSON parse error: {}", e)))?;

    let container_duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok());

    let streams: Vec<StreamInfo> = probe
        .streams
        .into_iter()
        .map(|s| StreamInfo {
            codec_type: s.codec_type.unwrap_or_else(|| "unknown".to_string()),
            codec_name: s.codec_name,
            duration: s
                .duration
                .and_then(|d| d.parse::<f64>().ok())
                .or(container_duration),
            sample_rate: s.sample_rate.and_then(|sr| sr.parse().ok()),
            channels: s.channels,
        })
        .collect();

    let result = StreamProbeResult {
        has_audio_stream: streams.iter().any(StreamInfo::is_audio),
        streams,
    };
    if !result.has_audio_stream {
        return Err(ValidationError::NoAudioStream);
    }
    Ok(result)
}
