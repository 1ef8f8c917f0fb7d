//! Data models for the audio upload pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_AUDIO_TYPE: &str = "user_speech";
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_LANGUAGE: &str = "ja-JP";

/// A single upload as received from the client. Never persisted.
#[derive(Debug, Clone)]
pub struct RawAudioSubmission {
    pub data: Vec<u8>,
    pub filename: String,
    pub content_type: Option<String>,
    pub session_id: Option<String>,
    pub metadata_json: Option<String>,
}

impl RawAudioSubmission {
    pub fn new(data: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            data,
            filename: filename.into(),
            content_type: None,
            session_id: None,
            metadata_json: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata_json(mut self, metadata_json: impl Into<String>) -> Self {
        self.metadata_json = Some(metadata_json.into());
        self
    }

    /// The session id, if one was supplied and is not blank.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Client-supplied metadata as parsed from JSON; every field may be absent or null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioMetadataInput {
    pub audio_type: Option<String>,
    pub format: Option<String>,
    pub duration: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub timestamp_start: Option<String>,
    pub timestamp_end: Option<String>,
    pub language: Option<String>,
}

impl AudioMetadataInput {
    /// Parse the metadata form field. Malformed JSON is logged and replaced by
    /// an empty input so that every field falls back to its default.
    pub fn parse(metadata_json: Option<&str>) -> Self {
        let Some(raw) = metadata_json.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_str::<Option<AudioMetadataInput>>(raw) {
            Ok(parsed) => parsed.unwrap_or_default(),
            Err(e) => {
                warn!("Invalid metadata JSON, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Merge with defaults into a fully populated record.
    pub fn resolve(self, declared_format: &str, now: DateTime<Utc>) -> AudioMetadata {
        let now_iso = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        AudioMetadata {
            audio_type: self
                .audio_type
                .unwrap_or_else(|| DEFAULT_AUDIO_TYPE.to_string()),
            format: self.format.unwrap_or_else(|| declared_format.to_string()),
            duration: self.duration.unwrap_or(0.0),
            sample_rate: self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
            channels: self.channels.unwrap_or(DEFAULT_CHANNELS),
            timestamp_start: self.timestamp_start.unwrap_or_else(|| now_iso.clone()),
            timestamp_end: self.timestamp_end.unwrap_or(now_iso),
            language: self.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        }
    }
}

/// Resolved audio metadata; no field is ever missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub audio_type: String,
    pub format: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_start: String,
    pub timestamp_end: String,
    pub language: String,
}

/// Attributes of one stream reported by the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub codec_type: String,
    pub codec_name: Option<String>,
    /// Duration in seconds.
    pub duration: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl StreamInfo {
    pub fn is_audio(&self) -> bool {
        self.codec_type == "audio"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamProbeResult {
    pub has_audio_stream: bool,
    pub streams: Vec<StreamInfo>,
}

impl StreamProbeResult {
    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.is_audio())
    }
}

/// An object written to the blob store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAudioObject {
    pub audio_id: Uuid,
    pub key: String,
    pub location: String,
    /// Always the canonical format.
    pub format: String,
    pub original_format: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// A signed, time-limited read URL for one stored object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessGrant {
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The response of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionResult {
    pub audio_id: Uuid,
    pub session_id: Option<String>,
    pub audio_type: String,
    pub blob_url: String,
    pub storage_key: String,
    pub format: String,
    pub original_format: String,
    pub sas_url: String,
    pub sas_expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub metadata: AudioMetadata,
    pub uploaded_at: DateTime<Utc>,
}

impl IngestionResult {
    pub fn new(
        stored: StoredAudioObject,
        session_id: Option<String>,
        metadata: AudioMetadata,
        grant: AccessGrant,
    ) -> Self {
        Self {
            audio_id: stored.audio_id,
            session_id,
            audio_type: metadata.audio_type.clone(),
            blob_url: stored.location,
            storage_key: stored.key,
            format: stored.format,
            original_format: stored.original_format,
            sas_url: grant.url,
            sas_expires_at: grant.expires_at,
            size_bytes: stored.size_bytes,
            metadata,
            uploaded_at: stored.created_at,
        }
    }
}
