//! Speech recording ingestion.
//!
//! Upload pipeline:
//! 1. Client metadata is resolved against defaults
//! 2. Size and content type are checked
//! 3. ffprobe confirms the payload carries an audio stream
//! 4. Non-canonical recordings are transcoded to MP4/AAC with ffmpeg
//! 5. The result is written to blob storage under a generated key
//! 6. A time-limited read URL is issued for the stored object

mod command;
mod converter;
mod file_handler;
mod models;
mod probe;
mod service;

pub use command::{
    CommandError, CommandOutput, ExternalCommand, ToolCommand, DEFAULT_COMMAND_TIMEOUT,
};
pub use converter::{
    build_conversion_args, is_canonical_format, AudioTranscoder, ConversionError,
    FfmpegTranscoder, CANONICAL_AUDIO_CODEC, CANONICAL_CHANNELS, CANONICAL_CONTENT_TYPE,
    CANONICAL_FORMAT, CANONICAL_SAMPLE_RATE,
};
pub use file_handler::{
    extract_format, is_allowed_content_type, sanitize_key_segment, FileHandler,
    ALLOWED_CONTENT_TYPES, DEFAULT_DECLARED_FORMAT,
};
pub use models::{
    AccessGrant, AudioMetadata, AudioMetadataInput, IngestionResult, RawAudioSubmission,
    StoredAudioObject, StreamInfo, StreamProbeResult, DEFAULT_AUDIO_TYPE, DEFAULT_CHANNELS,
    DEFAULT_LANGUAGE, DEFAULT_SAMPLE_RATE,
};
pub use probe::{parse_probe_output, AudioProbe, FfprobeProbe, ValidationError};
pub use service::{
    AudioUploadService, AudioUploadServiceConfig, UploadError, DEFAULT_MAX_UPLOAD_BYTES,
    DEFAULT_SAS_TTL,
};
