//! Temporary file handling for uploaded recordings.

use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;

/// Format assumed when the uploaded filename carries no extension.
pub const DEFAULT_DECLARED_FORMAT: &str = "webm";

/// Content types accepted without a warning.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "audio/webm",
    "audio/opus",
    "audio/wav",
    "audio/mpeg",
    "audio/mp4",
];

/// Creates scoped temporary files for probing and transcoding.
///
/// Every file handed out is a [`NamedTempFile`]: it is removed when dropped,
/// on success and on every error path alike.
#[derive(Debug, Clone)]
pub struct FileHandler {
    temp_dir: PathBuf,
}

impl FileHandler {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Initialize the file handler (creates temp directory).
    pub async fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.temp_dir).await
    }

    /// Allocate an empty, uniquely named temp file with the given extension.
    pub fn allocate(&self, extension: &str) -> std::io::Result<NamedTempFile> {
        std::fs::create_dir_all(&self.temp_dir)?;
        tempfile::Builder::new()
            .prefix("audio-")
            .suffix(&format!(".{}", sanitize_extension(extension)))
            .tempfile_in(&self.temp_dir)
    }

    /// Write `data` to a fresh temp file with the given extension.
    pub async fn write_temp(&self, data: &[u8], extension: &str) -> std::io::Result<NamedTempFile> {
        let file = self.allocate(extension)?;
        fs::write(file.path(), data).await?;
        Ok(file)
    }
}

/// Extract the declared format from an uploaded filename.
pub fn extract_format(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| DEFAULT_DECLARED_FORMAT.to_string())
}

/// Check whether a content type is one of the expected audio types.
pub fn is_allowed_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ALLOWED_CONTENT_TYPES.contains(&essence.as_str())
}

/// Make a caller-supplied value safe to use as one storage key segment.
pub fn sanitize_key_segment(value: &str) -> String {
    let segment: String = value
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    // "." and ".." are not valid path segments
    if segment.chars().all(|c| c == '.') {
        return "_".repeat(segment.len());
    }
    segment
}

fn sanitize_extension(extension: &str) -> String {
    let ext: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if ext.is_empty() {
        "bin".to_string()
    } else {
        ext
    }
}
