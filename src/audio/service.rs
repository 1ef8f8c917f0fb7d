//! The upload pipeline: validate, normalize, store and grant read access.

use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::converter::{is_canonical_format, AudioTranscoder, ConversionError, CANONICAL_FORMAT};
use super::file_handler::{extract_format, is_allowed_content_type};
use super::models::{
    AccessGrant, AudioMetadataInput, IngestionResult, RawAudioSubmission, StoredAudioObject,
};
use super::probe::{AudioProbe, ValidationError};
use crate::storage::{audio_object_key, AudioStore, StorageError, NO_SESSION_SENTINEL};

/// 100 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

pub const DEFAULT_SAS_TTL: Duration = Duration::from_secs(60 * 60);

/// Errors surfaced by the upload pipeline.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("validation error: {0}")]
    Validation(ValidationError),

    #[error("conversion error: {0}")]
    Conversion(ConversionError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<ValidationError> for UploadError {
    fn from(e: ValidationError) -> Self {
        match e {
            // A hung tool is a server fault, not a bad upload.
            ValidationError::ProbeTimeout(timeout) => {
                UploadError::Conversion(ConversionError::Timeout(timeout))
            }
            other => UploadError::Validation(other),
        }
    }
}

impl From<ConversionError> for UploadError {
    fn from(e: ConversionError) -> Self {
        match e {
            ConversionError::InvalidInput(v) => v.into(),
            other => UploadError::Conversion(other),
        }
    }
}

impl UploadError {
    /// Whether the failure was caused by the uploaded content.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            UploadError::Validation(v)
                if !matches!(v, ValidationError::Io(_) | ValidationError::ProbeTimeout(_))
        )
    }

    /// Message safe to return to the caller. Never includes tool output or paths.
    pub fn public_message(&self) -> String {
        match self {
            UploadError::Validation(ValidationError::EmptyPayload) => {
                "Empty audio file".to_string()
            }
            UploadError::Validation(ValidationError::FileTooLarge(size, max)) => format!(
                "File size ({} bytes) exceeds maximum limit ({} bytes)",
                size, max
            ),
            UploadError::Validation(ValidationError::Io(_)) => {
                "Failed to process audio file".to_string()
            }
            UploadError::Validation(ValidationError::ProbeTimeout(_))
            | UploadError::Conversion(ConversionError::Timeout(_)) => {
                "Audio processing timed out".to_string()
            }
            UploadError::Validation(_) => "Invalid or corrupt audio file".to_string(),
            UploadError::Conversion(_) => "Audio conversion failed".to_string(),
            UploadError::Storage(_) => "Failed to store audio".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioUploadServiceConfig {
    /// Maximum accepted payload size in bytes.
    pub max_upload_bytes: u64,
    /// Lifetime of issued read URLs.
    pub sas_ttl: Duration,
}

impl Default for AudioUploadServiceConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            sas_ttl: DEFAULT_SAS_TTL,
        }
    }
}

/// Turns uploaded recordings into stored canonical audio with a read URL.
pub struct AudioUploadService {
    probe: Arc<dyn AudioProbe>,
    transcoder: Arc<dyn AudioTranscoder>,
    store: Arc<dyn AudioStore>,
    config: AudioUploadServiceConfig,
}

impl AudioUploadService {
    pub fn new(
        probe: Arc<dyn AudioProbe>,
        transcoder: Arc<dyn AudioTranscoder>,
        store: Arc<dyn AudioStore>,
        config: AudioUploadServiceConfig,
    ) -> Self {
        Self {
            probe,
            transcoder,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn AudioStore> {
        &self.store
    }

    /// Run one submission through the pipeline. Stops at the first failing step.
    pub async fn ingest(
        &self,
        submission: RawAudioSubmission,
    ) -> Result<IngestionResult, UploadError> {
        let session_id = submission.session_id().map(str::to_string);
        let declared_format = extract_format(&submission.filename);
        let metadata = AudioMetadataInput::parse(submission.metadata_json.as_deref())
            .resolve(&declared_format, Utc::now());

        let size = submission.data.len() as u64;
        info!(
            "Audio upload received: file={} format={} size={} session={}",
            submission.filename,
            declared_format,
            size,
            session_id.as_deref().unwrap_or(NO_SESSION_SENTINEL)
        );

        if size == 0 {
            warn!("Rejected empty upload '{}'", submission.filename);
            return Err(ValidationError::EmptyPayload.into());
        }
        if size > self.config.max_upload_bytes {
            warn!(
                "Rejected upload '{}': {} bytes exceeds {} bytes",
                submission.filename, size, self.config.max_upload_bytes
            );
            return Err(ValidationError::FileTooLarge(size, self.config.max_upload_bytes).into());
        }
        if let Some(content_type) = submission.content_type.as_deref() {
            if !is_allowed_content_type(content_type) {
                warn!(
                    "Unexpected content type '{}' for '{}', continuing",
                    content_type, submission.filename
                );
            }
        }

        if let Err(e) = self.probe.probe(&submission.data, &declared_format).await {
            warn!("Rejected upload '{}': {}", submission.filename, e);
            return Err(e.into());
        }

        let data = if is_canonical_format(&declared_format) {
            submission.data
        } else {
            match self
                .transcoder
                .transcode(&submission.data, &declared_format)
                .await
            {
                Ok(converted) => converted,
                Err(e) => {
                    error!("Conversion of '{}' failed: {}", submission.filename, e);
                    return Err(e.into());
                }
            }
        };

        let stored = self
            .store_audio(data, session_id.as_deref(), &declared_format)
            .await?;

        let grant = match self.store.grant(&stored.location, self.config.sas_ttl).await {
            Ok(grant) => grant,
            Err(e) => {
                error!("Failed to grant access to {}: {}", stored.key, e);
                if !self.store.delete(&stored.location).await {
                    warn!("Stored audio {} left without an access grant", stored.key);
                }
                return Err(e.into());
            }
        };

        info!(
            "Audio upload complete: audio_id={} key={} size={} expires_at={}",
            stored.audio_id, stored.key, stored.size_bytes, grant.expires_at
        );
        Ok(IngestionResult::new(stored, session_id, metadata, grant))
    }

    async fn store_audio(
        &self,
        data: Vec<u8>,
        session_id: Option<&str>,
        original_format: &str,
    ) -> Result<StoredAudioObject, UploadError> {
        let audio_id = Uuid::new_v4();
        let created_at = Utc::now();
        let key = audio_object_key(session_id, &audio_id, &created_at, CANONICAL_FORMAT);
        let size_bytes = data.len() as u64;

        let metadata = BTreeMap::from([
            ("audio_id".to_string(), audio_id.to_string()),
            (
                "session_id".to_string(),
                session_id.unwrap_or(NO_SESSION_SENTINEL).to_string(),
            ),
            (
                "uploaded_at".to_string(),
                created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("format".to_string(), CANONICAL_FORMAT.to_string()),
            ("original_format".to_string(), original_format.to_string()),
        ]);

        let location = match self.store.put(data, &key, &metadata).await {
            Ok(location) => location,
            Err(e) => {
                error!("Failed to store {}: {}", key, e);
                return Err(e.into());
            }
        };
        info!("Stored audio {} at {}", audio_id, key);

        Ok(StoredAudioObject {
            audio_id,
            key,
            location,
            format: CANONICAL_FORMAT.to_string(),
            original_format: original_format.to_string(),
            size_bytes,
            created_at,
        })
    }

    /// Issue a fresh read URL for an already stored object.
    pub async fn grant_access(&self, location: &str) -> Result<AccessGrant, UploadError> {
        Ok(self.store.grant(location, self.config.sas_ttl).await?)
    }

    pub async fn delete_audio(&self, location: &str) -> bool {
        self.store.delete(location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::models::{StreamInfo, StreamProbeResult};
    use crate::audio::DEFAULT_AUDIO_TYPE;
    use crate::storage::{BlobAudioStore, StorageBackend, StorageSettings};
    use async_trait::async_trait;
    use regex::Regex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Accepts payloads starting with `AUDIO`, like a probe that knows one magic number.
    #[derive(Default)]
    struct MagicProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AudioProbe for MagicProbe {
        async fn probe_file(&self, path: &Path) -> Result<StreamProbeResult, ValidationError> {
            let data = std::fs::read(path)?;
            self.probe(&data, "bin").await
        }

        async fn probe(
            &self,
            data: &[u8],
            _declared_format: &str,
        ) -> Result<StreamProbeResult, ValidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if data.is_empty() {
                return Err(ValidationError::EmptyPayload);
            }
            if data.starts_with(b"HANG") {
                return Err(ValidationError::ProbeTimeout(Duration::from_secs(120)));
            }
            if !data.starts_with(b"AUDIO") {
                return Err(ValidationError::ProbeFailed(
                    "Invalid data found when processing input".to_string(),
                ));
            }
            Ok(StreamProbeResult {
                has_audio_stream: true,
                streams: vec![StreamInfo {
                    codec_type: "audio".to_string(),
                    codec_name: Some("opus".to_string()),
                    duration: Some(1.0),
                    sample_rate: Some(48000),
                    channels: Some(1),
                }],
            })
        }
    }

    #[derive(Default)]
    struct FakeTranscoder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AudioTranscoder for FakeTranscoder {
        async fn transcode(
            &self,
            data: &[u8],
            _source_format: &str,
        ) -> Result<Vec<u8>, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConversionError::ProcessFailed {
                    command: "ffmpeg -i /tmp/in.webm".to_string(),
                    status: "exit status 1".to_string(),
                    output: "boom".to_string(),
                });
            }
            let mut out = b"MP4:".to_vec();
            out.extend_from_slice(data);
            Ok(out)
        }
    }

    /// In-memory store that records calls and can fail grants.
    struct RecordingStore {
        inner: BlobAudioStore,
        puts: Mutex<Vec<(String, Vec<u8>, BTreeMap<String, String>)>>,
        deletes: AtomicUsize,
        fail_grant: bool,
    }

    impl RecordingStore {
        fn new(fail_grant: bool) -> Self {
            Self {
                inner: BlobAudioStore::new(&StorageSettings::memory("audio")).unwrap(),
                puts: Mutex::new(Vec::new()),
                deletes: AtomicUsize::new(0),
                fail_grant,
            }
        }

        fn put_count(&self) -> usize {
            self.puts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AudioStore for RecordingStore {
        async fn ensure_container_exists(&self) -> Result<(), StorageError> {
            self.inner.ensure_container_exists().await
        }

        async fn put(
            &self,
            data: Vec<u8>,
            key: &str,
            metadata: &BTreeMap<String, String>,
        ) -> Result<String, StorageError> {
            self.puts
                .lock()
                .unwrap()
                .push((key.to_string(), data.clone(), metadata.clone()));
            self.inner.put(data, key, metadata).await
        }

        async fn grant(
            &self,
            location: &str,
            ttl: Duration,
        ) -> Result<AccessGrant, StorageError> {
            if self.fail_grant {
                return Err(StorageError::Signing("signing key rejected".to_string()));
            }
            self.inner.grant(location, ttl).await
        }

        async fn delete(&self, location: &str) -> bool {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(location).await
        }

        fn backend(&self) -> StorageBackend {
            StorageBackend::Memory
        }

        fn container(&self) -> &str {
            self.inner.container()
        }
    }

    const TEST_MAX: u64 = 64;

    struct Harness {
        probe: Arc<MagicProbe>,
        transcoder: Arc<FakeTranscoder>,
        store: Arc<RecordingStore>,
        service: AudioUploadService,
    }

    fn harness_with(transcoder: FakeTranscoder, store: RecordingStore) -> Harness {
        let probe = Arc::new(MagicProbe::default());
        let transcoder = Arc::new(transcoder);
        let store = Arc::new(store);
        let service = AudioUploadService::new(
            probe.clone(),
            transcoder.clone(),
            store.clone(),
            AudioUploadServiceConfig {
                max_upload_bytes: TEST_MAX,
                sas_ttl: Duration::from_secs(3600),
            },
        );
        Harness {
            probe,
            transcoder,
            store,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeTranscoder::default(), RecordingStore::new(false))
    }

    fn audio_bytes(len: usize) -> Vec<u8> {
        let mut data = b"AUDIO".to_vec();
        data.resize(len, 0x42);
        data
    }

    #[tokio::test]
    async fn test_webm_upload_with_session() {
        let h = harness();
        let submission = RawAudioSubmission::new(audio_bytes(32), "clip.webm")
            .with_content_type("audio/webm;codecs=opus")
            .with_session_id("abc123");

        let result = h.service.ingest(submission).await.unwrap();

        let pattern = Regex::new(r"^audio/abc123/[0-9a-f-]{36}_\d{8}_\d{6}\.mp4$").unwrap();
        assert!(pattern.is_match(&result.storage_key), "key: {}", result.storage_key);
        assert_eq!(result.format, "mp4");
        assert_eq!(result.original_format, "webm");
        assert_eq!(result.session_id.as_deref(), Some("abc123"));
        assert_eq!(result.audio_id.get_version_num(), 4);
        assert!(result.storage_key.contains(&result.audio_id.to_string()));
        assert!(result.sas_url.contains(&result.storage_key));
        assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);

        let puts = h.store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        let (key, data, metadata) = &puts[0];
        assert_eq!(key, &result.storage_key);
        assert!(data.starts_with(b"MP4:"));
        assert_eq!(result.size_bytes, data.len() as u64);
        assert_eq!(metadata["audio_id"], result.audio_id.to_string());
        assert_eq!(metadata["session_id"], "abc123");
        assert_eq!(metadata["format"], "mp4");
        assert_eq!(metadata["original_format"], "webm");
    }

    #[tokio::test]
    async fn test_canonical_format_is_passed_through() {
        for filename in ["clip.mp4", "clip.M4A"] {
            let h = harness();
            let input = audio_bytes(40);

            let result = h
                .service
                .ingest(RawAudioSubmission::new(input.clone(), filename))
                .await
                .unwrap();

            assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 0);
            let puts = h.store.puts.lock().unwrap();
            assert_eq!(puts[0].1, input, "file: {}", filename);
            assert!(result.storage_key.ends_with(".mp4"));
            assert!(result.storage_key.starts_with("audio/"));
            assert_eq!(result.session_id, None);
            assert_eq!(puts[0].2["session_id"], NO_SESSION_SENTINEL);
        }
    }

    #[tokio::test]
    async fn test_grant_window_matches_ttl() {
        let h = harness();

        let result = h
            .service
            .ingest(RawAudioSubmission::new(audio_bytes(16), "a.webm"))
            .await
            .unwrap();

        let window = (result.sas_expires_at - result.uploaded_at).num_seconds();
        assert!((3599..=3600).contains(&window), "window: {}", window);
        let grant = h.service.grant_access(&result.blob_url).await.unwrap();
        assert_eq!(
            (grant.expires_at - grant.issued_at).to_std().unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_repeated_grants_issue_distinct_urls_for_same_key() {
        let h = harness();
        let result = h
            .service
            .ingest(RawAudioSubmission::new(audio_bytes(16), "a.webm"))
            .await
            .unwrap();

        let first = h.service.grant_access(&result.blob_url).await.unwrap();
        let second = h.service.grant_access(&result.blob_url).await.unwrap();

        assert_ne!(first.url, result.sas_url);
        assert_ne!(first.url, second.url);
        for url in [&first.url, &second.url] {
            assert!(url.starts_with(&result.blob_url), "url: {}", url);
        }
    }

    #[tokio::test]
    async fn test_size_boundaries() {
        let h = harness();

        assert!(h
            .service
            .ingest(RawAudioSubmission::new(audio_bytes(TEST_MAX as usize), "max.webm"))
            .await
            .is_ok());

        let err = h
            .service
            .ingest(RawAudioSubmission::new(
                audio_bytes(TEST_MAX as usize + 1),
                "over.webm",
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Validation(ValidationError::FileTooLarge(65, 64))
        ));
        assert!(err.is_client_error());

        let err = h
            .service
            .ingest(RawAudioSubmission::new(Vec::new(), "empty.webm"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Validation(ValidationError::EmptyPayload)
        ));

        assert_eq!(h.store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_garbage_is_rejected_before_storage() {
        let h = harness_with(FakeTranscoder::default(), RecordingStore::new(false));
        let service = AudioUploadService::new(
            h.probe.clone(),
            h.transcoder.clone(),
            h.store.clone(),
            AudioUploadServiceConfig::default(),
        );

        let err = service
            .ingest(RawAudioSubmission::new(vec![0xAB; 500], "noise.webm"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Validation(_)));
        assert!(err.is_client_error());
        assert_eq!(err.public_message(), "Invalid or corrupt audio file");
        assert_eq!(h.probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_conversion_failure_skips_storage() {
        let h = harness_with(
            FakeTranscoder {
                fail: true,
                ..Default::default()
            },
            RecordingStore::new(false),
        );

        let err = h
            .service
            .ingest(RawAudioSubmission::new(audio_bytes(20), "clip.wav"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Conversion(_)));
        assert!(!err.is_client_error());
        assert_eq!(err.public_message(), "Audio conversion failed");
        assert!(!err.public_message().contains("/tmp"));
        assert_eq!(h.store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_server_error() {
        let h = harness();

        let err = h
            .service
            .ingest(RawAudioSubmission::new(b"HANG and never return".to_vec(), "clip.webm"))
            .await
            .unwrap_err();

        assert!(
            matches!(err, UploadError::Conversion(ConversionError::Timeout(_))),
            "unexpected error: {:?}",
            err
        );
        assert!(!err.is_client_error());
        assert_eq!(err.public_message(), "Audio processing timed out");
        assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_grant_failure_removes_stored_object() {
        let h = harness_with(FakeTranscoder::default(), RecordingStore::new(true));

        let err = h
            .service
            .ingest(RawAudioSubmission::new(audio_bytes(20), "clip.webm"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Storage(StorageError::Signing(_))));
        assert!(!err.is_client_error());
        assert_eq!(h.store.put_count(), 1);
        assert_eq!(h.store.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metadata_defaults_and_overrides() {
        let h = harness();

        let result = h
            .service
            .ingest(
                RawAudioSubmission::new(audio_bytes(20), "clip.webm")
                    .with_metadata_json("{this is not json"),
            )
            .await
            .unwrap();
        assert_eq!(result.audio_type, DEFAULT_AUDIO_TYPE);
        assert_eq!(result.metadata.format, "webm");
        assert_eq!(result.metadata.sample_rate, 48000);
        assert_eq!(result.metadata.channels, 1);
        assert_eq!(result.metadata.language, "ja-JP");
        assert_eq!(result.metadata.duration, 0.0);

        let result = h
            .service
            .ingest(
                RawAudioSubmission::new(audio_bytes(20), "clip.webm")
                    .with_metadata_json(r#"{"audio_type": "assistant_reply", "duration": 2.5}"#),
            )
            .await
            .unwrap();
        assert_eq!(result.audio_type, "assistant_reply");
        assert_eq!(result.metadata.duration, 2.5);
    }

    #[tokio::test]
    async fn test_unknown_content_type_is_not_fatal() {
        let h = harness();

        let result = h
            .service
            .ingest(
                RawAudioSubmission::new(audio_bytes(20), "clip.webm")
                    .with_content_type("application/octet-stream"),
            )
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_delete_audio() {
        let h = harness();
        let result = h
            .service
            .ingest(RawAudioSubmission::new(audio_bytes(20), "clip.mp4"))
            .await
            .unwrap();

        assert!(h.service.delete_audio(&result.blob_url).await);
        assert!(!h.service.delete_audio("https://elsewhere.example/x.mp4").await);
        assert!(matches!(
            h.service.grant_access("https://elsewhere.example/x.mp4").await,
            Err(UploadError::Storage(StorageError::InvalidLocation(_)))
        ));
    }

    #[test]
    fn test_invalid_input_conversion_maps_to_validation() {
        let err: UploadError = ConversionError::InvalidInput(ValidationError::NoAudioStream).into();
        assert!(matches!(
            err,
            UploadError::Validation(ValidationError::NoAudioStream)
        ));
        assert!(err.is_client_error());

        let err: UploadError =
            ConversionError::from(ValidationError::ProbeTimeout(Duration::from_secs(1))).into();
        assert!(matches!(err, UploadError::Conversion(ConversionError::Timeout(_))));
        assert!(!err.is_client_error());
    }
}
