//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own in-memory blob store and
//! media tool doubles.

use super::constants::*;
use super::fixtures::{MagicProbe, TaggingTranscoder};
use audio_upload_server::audio::{AudioUploadService, AudioUploadServiceConfig};
use audio_upload_server::server::{make_app, RequestsLoggingLevel, ServerConfig, ServerState};
use audio_upload_server::storage::{BlobAudioStore, StorageSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Test server instance
///
/// When dropped, the server gracefully shuts down.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port
    pub async fn spawn() -> Self {
        let store = BlobAudioStore::connect(&StorageSettings::memory(TEST_CONTAINER))
            .await
            .expect("Failed to create in-memory store");

        let upload_service = Arc::new(AudioUploadService::new(
            Arc::new(MagicProbe),
            Arc::new(TaggingTranscoder),
            Arc::new(store),
            AudioUploadServiceConfig {
                max_upload_bytes: TEST_MAX_UPLOAD_BYTES,
                sas_ttl: Duration::from_secs(3600),
            },
        ));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            max_body_bytes: (TEST_MAX_UPLOAD_BYTES * 4) as usize,
        };
        let app = make_app(ServerState::new(
            config,
            upload_service,
            "test-hash".to_string(),
        ));

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            _shutdown_tx: Some(shutdown_tx),
        };
        server.wait_for_ready().await;
        server
    }

    /// Waits for the server to become ready by polling the /health endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
