//! Recording storage over `object_store`, with locally signed read grants.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use object_store::azure::MicrosoftAzureBuilder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use rand::RngCore;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sas::{validate_ttl, SharedKeySigner, SAS_VERSION};
use super::StorageError;
use crate::audio::{sanitize_key_segment, AccessGrant, CANONICAL_CONTENT_TYPE};

/// Stored in place of the session id in object metadata when none was given.
pub const NO_SESSION_SENTINEL: &str = "no-session";

const KEY_PREFIX: &str = "audio";
const EMULATOR_ENDPOINT: &str = "http://127.0.0.1:10000";
const MEMORY_ACCOUNT: &str = "local";
/// How long signed start times are remembered per key.
const START_HISTORY_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Azure,
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Azure => write!(f, "azure"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub container: String,
    pub use_emulator: bool,
    /// Account URL used instead of the one derived from the account name.
    pub endpoint: Option<String>,
}

impl fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSettings")
            .field("backend", &self.backend)
            .field("account_name", &self.account_name)
            .field("account_key", &self.account_key.as_ref().map(|_| "<redacted>"))
            .field("container", &self.container)
            .field("use_emulator", &self.use_emulator)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl StorageSettings {
    pub fn memory(container: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Memory,
            account_name: None,
            account_key: None,
            container: container.into(),
            use_emulator: false,
            endpoint: None,
        }
    }
}

/// Durable storage for normalized recordings.
#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Create the container if it does not exist yet.
    async fn ensure_container_exists(&self) -> Result<(), StorageError>;

    /// Write `data` under `key`, replacing any existing object, and return its location.
    async fn put(
        &self,
        data: Vec<u8>,
        key: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, StorageError>;

    /// Issue a read-only URL for the object at `location`, valid for `ttl`.
    async fn grant(&self, location: &str, ttl: Duration) -> Result<AccessGrant, StorageError>;

    /// Best-effort removal; `false` on any failure.
    async fn delete(&self, location: &str) -> bool;

    fn backend(&self) -> StorageBackend;

    fn container(&self) -> &str;
}

/// Build the storage key for a new recording.
///
/// `audio/[{session}/]{audio_id}_{yyyymmdd_HHMMSS}.{extension}`
pub fn audio_object_key(
    session_id: Option<&str>,
    audio_id: &Uuid,
    at: &DateTime<Utc>,
    extension: &str,
) -> String {
    let file_name = format!("{}_{}.{}", audio_id, at.format("%Y%m%d_%H%M%S"), extension);
    match session_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(session) => format!(
            "{}/{}/{}",
            KEY_PREFIX,
            sanitize_key_segment(session),
            file_name
        ),
        None => format!("{}/{}", KEY_PREFIX, file_name),
    }
}

/// Metadata travels as `x-ms-meta-*` headers, which only carry visible ASCII.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

/// Signed start times handed out per key.
///
/// A grant signs the latest whole second at or before issuance that no earlier
/// grant for the same key used, so back-to-back grants never share a token.
#[derive(Default)]
struct IssuedStarts {
    by_key: HashMap<String, BTreeSet<i64>>,
}

impl IssuedStarts {
    fn reserve(&mut self, key: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let horizon = now.timestamp() - START_HISTORY_SECS;
        self.by_key.retain(|_, starts| {
            starts.retain(|start| *start >= horizon);
            !starts.is_empty()
        });

        let starts = self.by_key.entry(key.to_string()).or_default();
        let mut start = now.timestamp();
        while starts.contains(&start) {
            start -= 1;
        }
        starts.insert(start);
        DateTime::from_timestamp(start, 0).unwrap_or(now)
    }
}

/// [`AudioStore`] over an `object_store` backend with locally signed SAS grants.
pub struct BlobAudioStore {
    object_store: Arc<dyn ObjectStore>,
    signer: SharedKeySigner,
    http: reqwest::Client,
    backend: StorageBackend,
    container: String,
    endpoint: String,
    issued_starts: Mutex<IssuedStarts>,
}

impl BlobAudioStore {
    pub fn new(settings: &StorageSettings) -> Result<Self, StorageError> {
        if settings.container.trim().is_empty() {
            return Err(StorageError::Config("container name is empty".to_string()));
        }
        let container = settings.container.trim().to_string();

        let (object_store, signer, endpoint): (Arc<dyn ObjectStore>, SharedKeySigner, String) =
            match settings.backend {
                StorageBackend::Azure => {
                    let account = settings.account_name.as_deref().ok_or_else(|| {
                        StorageError::Config("AZURE_STORAGE_ACCOUNT_NAME is not set".to_string())
                    })?;
                    let key = settings.account_key.as_deref().ok_or_else(|| {
                        StorageError::Config("AZURE_STORAGE_ACCOUNT_KEY is not set".to_string())
                    })?;
                    let endpoint = match settings.endpoint.as_deref() {
                        Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
                        None if settings.use_emulator => {
                            format!("{}/{}", EMULATOR_ENDPOINT, account)
                        }
                        None => format!("https://{}.blob.core.windows.net", account),
                    };
                    let allow_http = endpoint.starts_with("http://");
                    let signer = SharedKeySigner::new(account, key, allow_http)?;
                    let mut builder = MicrosoftAzureBuilder::new()
                        .with_account(account)
                        .with_access_key(key)
                        .with_container_name(&container)
                        .with_allow_http(allow_http);
                    builder = match settings.endpoint {
                        Some(_) => builder.with_endpoint(endpoint.clone()),
                        None => builder.with_use_emulator(settings.use_emulator),
                    };
                    let store = builder
                        .build()
                        .map_err(|e| StorageError::Config(e.to_string()))?;
                    (Arc::new(store) as Arc<dyn ObjectStore>, signer, endpoint)
                }
                StorageBackend::Memory => {
                    let account = settings.account_name.as_deref().unwrap_or(MEMORY_ACCOUNT);
                    let key = match settings.account_key.as_deref() {
                        Some(key) => key.to_string(),
                        None => {
                            let mut bytes = [0u8; 32];
                            rand::rng().fill_bytes(&mut bytes);
                            STANDARD.encode(bytes)
                        }
                    };
                    let signer = SharedKeySigner::new(account, &key, true)?;
                    let endpoint = format!("memory://{}", account);
                    (Arc::new(InMemory::new()) as Arc<dyn ObjectStore>, signer, endpoint)
                }
            };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            object_store,
            signer,
            http,
            backend: settings.backend,
            container,
            endpoint,
            issued_starts: Mutex::new(IssuedStarts::default()),
        })
    }

    /// Construct the store and make sure its container exists.
    pub async fn connect(settings: &StorageSettings) -> Result<Self, StorageError> {
        let store = Self::new(settings)?;
        store.ensure_container_exists().await?;
        Ok(store)
    }

    pub fn location_for(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, key)
    }

    /// Recover the object key from a location produced by [`Self::location_for`].
    pub fn key_from_location(&self, location: &str) -> Result<String, StorageError> {
        let without_query = location.split(['?', '#']).next().unwrap_or(location);
        let prefix = format!("{}/{}/", self.endpoint, self.container);
        without_query
            .strip_prefix(&prefix)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidLocation(location.to_string()))
    }

    async fn create_azure_container(&self) -> Result<(), StorageError> {
        let unavailable = |reason: String| StorageError::ContainerUnavailable {
            container: self.container.clone(),
            reason,
        };

        let now = Utc::now().trunc_subsecs(0);
        let sas = self.signer.container_create_sas(
            &(now - chrono::Duration::minutes(5)),
            &(now + chrono::Duration::minutes(15)),
        )?;
        let url = format!(
            "{}/{}?restype=container&{}",
            self.endpoint, self.container, sas
        );

        let response = self
            .http
            .put(&url)
            .header("x-ms-version", SAS_VERSION)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::CREATED => {
                info!("Created storage container '{}'", self.container);
                Ok(())
            }
            reqwest::StatusCode::CONFLICT => {
                debug!("Storage container '{}' already exists", self.container);
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(unavailable(format!("HTTP {}: {}", status, body.trim())))
            }
        }
    }
}

#[async_trait]
impl AudioStore for BlobAudioStore {
    async fn ensure_container_exists(&self) -> Result<(), StorageError> {
        match self.backend {
            StorageBackend::Azure => self.create_azure_container().await,
            StorageBackend::Memory => Ok(()),
        }
    }

    async fn put(
        &self,
        data: Vec<u8>,
        key: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, StorageError> {
        let path = ObjectPath::parse(key).map_err(|e| StorageError::Upload {
            key: key.to_string(),
            source: e.into(),
        })?;

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, CANONICAL_CONTENT_TYPE.into());
        for (name, value) in metadata {
            attributes.insert(Attribute::Metadata(name.clone().into()), header_safe(value).into());
        }
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        let size = data.len();
        self.object_store
            .put_opts(&path, PutPayload::from(data), opts)
            .await
            .map_err(|source| StorageError::Upload {
                key: key.to_string(),
                source,
            })?;

        debug!("Stored {} bytes at '{}'", size, key);
        Ok(self.location_for(key))
    }

    async fn grant(&self, location: &str, ttl: Duration) -> Result<AccessGrant, StorageError> {
        validate_ttl(ttl).map_err(StorageError::Signing)?;
        let key = self.key_from_location(location)?;

        let issued_at = Utc::now().trunc_subsecs(0);
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl).map_err(|e| StorageError::Signing(e.to_string()))?;
        let start = self.issued_starts.lock().unwrap().reserve(&key, issued_at);
        let sas = self
            .signer
            .blob_read_sas(&self.container, &key, &start, &expires_at)?;

        Ok(AccessGrant {
            url: format!("{}?{}", self.location_for(&key), sas),
            issued_at,
            expires_at,
        })
    }

    async fn delete(&self, location: &str) -> bool {
        let key = match self.key_from_location(location) {
            Ok(key) => key,
            Err(e) => {
                warn!("Not deleting '{}': {}", location, e);
                return false;
            }
        };
        let path = match ObjectPath::parse(&key) {
            Ok(path) => path,
            Err(e) => {
                warn!("Not deleting '{}': {}", key, e);
                return false;
            }
        };
        match self.object_store.delete(&path).await {
            Ok(()) => {
                info!("Deleted stored audio '{}'", key);
                true
            }
            Err(e) => {
                warn!("Failed to delete stored audio '{}': {}", key, e);
                false
            }
        }
    }

    fn backend(&self) -> StorageBackend {
        self.backend
    }

    fn container(&self) -> &str {
        &self.container
    }
}
