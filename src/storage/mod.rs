//! Durable blob storage for normalized recordings.
//!
//! Data I/O goes through the `object_store` crate (Azure Blob Storage in
//! production, in-memory for development and tests); read access is handed
//! out as shared-key SAS URLs signed locally.

mod blob_store;
mod sas;

pub use blob_store::{
    audio_object_key, AudioStore, BlobAudioStore, StorageBackend, StorageSettings,
    NO_SESSION_SENTINEL,
};
pub use sas::{validate_ttl, SharedKeySigner, MAX_SAS_TTL, SAS_VERSION};

use thiserror::Error;

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("container '{container}' unavailable: {reason}")]
    ContainerUnavailable { container: String, reason: String },

    #[error("upload of '{key}' failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("location '{0}' does not belong to this container")]
    InvalidLocation(String),

    #[error("failed to sign access grant: {0}")]
    Signing(String),
}
