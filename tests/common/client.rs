//! HTTP client for end-to-end tests
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use std::time::Duration;

pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    /// POST /audio/upload with an `audio_file` part and optional metadata/session.
    pub async fn upload(
        &self,
        filename: &str,
        data: Vec<u8>,
        metadata: Option<&str>,
        session_id: Option<&str>,
    ) -> Response {
        let part = Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str("audio/webm")
            .expect("Invalid mime type");
        let mut form = Form::new().part("audio_file", part);
        if let Some(metadata) = metadata {
            form = form.text("metadata", metadata.to_string());
        }
        self.send_form(form, session_id).await
    }

    /// POST /audio/upload with an arbitrary form.
    pub async fn send_form(&self, form: Form, session_id: Option<&str>) -> Response {
        let mut request = self
            .client
            .post(format!("{}/audio/upload", self.base_url))
            .multipart(form);
        if let Some(session_id) = session_id {
            request = request.header("session-id", session_id);
        }
        request.send().await.expect("Upload request failed")
    }

    pub async fn health(&self) -> Response {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .expect("Health request failed")
    }

    pub async fn audio_health(&self) -> Response {
        self.client
            .get(format!("{}/audio/health", self.base_url))
            .send()
            .await
            .expect("Audio health request failed")
    }
}
