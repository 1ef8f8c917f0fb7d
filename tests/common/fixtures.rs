//! Media tool doubles and payload fixtures

#![allow(dead_code)]

use super::constants::AUDIO_MAGIC;
use async_trait::async_trait;
use audio_upload_server::audio::{
    AudioProbe, AudioTranscoder, ConversionError, StreamInfo, StreamProbeResult, ValidationError,
};
use std::path::Path;

/// Probe that recognizes payloads starting with [`AUDIO_MAGIC`].
pub struct MagicProbe;

#[async_trait]
impl AudioProbe for MagicProbe {
    async fn probe_file(&self, path: &Path) -> Result<StreamProbeResult, ValidationError> {
        let data = tokio::fs::read(path).await?;
        self.probe(&data, "bin").await
    }

    async fn probe(
        &self,
        data: &[u8],
        _declared_format: &str,
    ) -> Result<StreamProbeResult, ValidationError> {
        if data.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if !data.starts_with(AUDIO_MAGIC) {
            return Err(ValidationError::ProbeFailed(
                "/tmp/audio-x.webm: Invalid data found when processing input".to_string(),
            ));
        }
        Ok(StreamProbeResult {
            has_audio_stream: true,
            streams: vec![StreamInfo {
                codec_type: "audio".to_string(),
                codec_name: Some("opus".to_string()),
                duration: Some(1.5),
                sample_rate: Some(48000),
                channels: Some(1),
            }],
        })
    }
}

/// Transcoder that tags the payload instead of running ffmpeg.
pub struct TaggingTranscoder;

#[async_trait]
impl AudioTranscoder for TaggingTranscoder {
    async fn transcode(
        &self,
        data: &[u8],
        _source_format: &str,
    ) -> Result<Vec<u8>, ConversionError> {
        let mut out = b"MP4:".to_vec();
        out.extend_from_slice(data);
        Ok(out)
    }
}

/// A payload the test probe accepts, `len` bytes long.
pub fn valid_clip_of(len: usize) -> Vec<u8> {
    let mut data = AUDIO_MAGIC.to_vec();
    data.resize(len.max(AUDIO_MAGIC.len()), 0x2A);
    data
}

pub fn valid_clip() -> Vec<u8> {
    valid_clip_of(256)
}

pub fn garbage_bytes(len: usize) -> Vec<u8> {
    vec![0xAB; len]
}
