//! Audio normalization using ffmpeg.
//!
//! Every stored recording is converted to the canonical format: AAC audio in
//! an MP4 container, 44.1 kHz stereo.

use async_trait::async_trait;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use super::command::{CommandError, ToolCommand};
use super::file_handler::FileHandler;
use super::probe::{AudioProbe, ValidationError};

/// Container/extension of every stored object.
pub const CANONICAL_FORMAT: &str = "mp4";
pub const CANONICAL_CONTENT_TYPE: &str = "audio/mp4";
pub const CANONICAL_AUDIO_CODEC: &str = "aac";
pub const CANONICAL_SAMPLE_RATE: u32 = 44100;
pub const CANONICAL_CHANNELS: u16 = 2;

/// Errors that can occur during audio conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid input: {0}")]
    InvalidInput(ValidationError),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("ffmpeg failed ({status}) running `{command}`: {output}")]
    ProcessFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("empty output")]
    EmptyOutput,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for ConversionError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::ProbeTimeout(timeout) => ConversionError::Timeout(timeout),
            other => ConversionError::InvalidInput(other),
        }
    }
}

impl ConversionError {
    fn from_command(e: CommandError) -> Self {
        match e {
            CommandError::Timeout { timeout, .. } => ConversionError::Timeout(timeout),
            CommandError::Spawn { command, source } | CommandError::Io { command, source } => {
                ConversionError::ProcessFailed {
                    command,
                    status: "not started".to_string(),
                    output: source.to_string(),
                }
            }
            CommandError::InvalidCommandLine(line) => ConversionError::ProcessFailed {
                command: line,
                status: "not started".to_string(),
                output: "invalid command line".to_string(),
            },
        }
    }
}

/// Whether bytes declared as `format` can be stored without conversion.
pub fn is_canonical_format(format: &str) -> bool {
    matches!(format.to_ascii_lowercase().as_str(), "mp4" | "m4a")
}

/// Explicit demuxer for source formats ffmpeg misdetects when read from a file.
///
/// Browser MediaRecorder webm has no duration/cues and needs the hint; every
/// other format is auto-detected.
fn demuxer_hint(source_format: &str) -> Option<&'static str> {
    match source_format.to_ascii_lowercase().as_str() {
        "webm" => Some("webm"),
        _ => None,
    }
}

/// Build the ffmpeg arguments converting `input` into the canonical format at `output`.
pub fn build_conversion_args(input: &Path, output: &Path, source_format: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];
    if let Some(demuxer) = demuxer_hint(source_format) {
        args.push("-f".into());
        args.push(demuxer.into());
    }
    args.push("-i".into());
    args.push(input.to_string_lossy().into_owned());
    // -vn drops video and cover art streams
    args.extend([
        "-vn".to_string(),
        "-c:a".to_string(),
        CANONICAL_AUDIO_CODEC.to_string(),
        "-ar".to_string(),
        CANONICAL_SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        CANONICAL_CHANNELS.to_string(),
        "-f".to_string(),
        CANONICAL_FORMAT.to_string(),
    ]);
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Converts recordings into the canonical format.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn transcode(&self, data: &[u8], source_format: &str)
        -> Result<Vec<u8>, ConversionError>;
}

/// [`AudioTranscoder`] backed by the ffmpeg CLI.
pub struct FfmpegTranscoder {
    ffmpeg: ToolCommand,
    probe: Arc<dyn AudioProbe>,
    files: FileHandler,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(
        ffmpeg: ToolCommand,
        probe: Arc<dyn AudioProbe>,
        files: FileHandler,
        timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg,
            probe,
            files,
            timeout,
        }
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        data: &[u8],
        source_format: &str,
    ) -> Result<Vec<u8>, ConversionError> {
        if data.is_empty() {
            return Err(ValidationError::EmptyPayload.into());
        }

        // Both files are removed on drop, on every path out of this function.
        let input = self.files.write_temp(data, source_format).await?;
        let output = self.files.allocate(CANONICAL_FORMAT)?;

        self.probe.probe_file(input.path()).await?;

        let command = self
            .ffmpeg
            .invocation(self.timeout)
            .args(build_conversion_args(input.path(), output.path(), source_format));
        let command_line = command.command_line();

        let result = command.run().await.map_err(|e| {
            error!("ffmpeg invocation failed: {}", e);
            ConversionError::from_command(e)
        })?;

        if !result.success() {
            return Err(ConversionError::ProcessFailed {
                command: command_line,
                status: describe_status(&result.status),
                output: result.combined_output(),
            });
        }

        let converted = tokio::fs::read(output.path()).await.unwrap_or_default();
        if converted.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }

        debug!(
            "Converted {} bytes of {} into {} bytes of {}",
            data.len(),
            source_format,
            converted.len(),
            CANONICAL_FORMAT
        );
        Ok(converted)
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}
