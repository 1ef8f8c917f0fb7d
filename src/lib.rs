//! Audio Upload Server Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod audio;
pub mod config;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use audio::{AudioUploadService, AudioUploadServiceConfig, UploadError};
pub use server::{make_app, run_server, RequestsLoggingLevel, ServerConfig, ServerState};
pub use storage::{AudioStore, BlobAudioStore, StorageBackend, StorageSettings};
