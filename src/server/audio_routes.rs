//! Audio upload HTTP routes.

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::audio::RawAudioSubmission;
use crate::server::state::{GuardedUploadService, ServerState};

const SESSION_ID_HEADER: &str = "session-id";
const AUDIO_FILE_FIELD: &str = "audio_file";
const METADATA_FIELD: &str = "metadata";
const FALLBACK_FILENAME: &str = "upload";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[derive(Debug, Serialize)]
struct AudioHealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: String,
    container: String,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            detail: detail.into(),
        }),
    )
        .into_response()
}

/// POST /upload - Upload one recording (multipart/form-data)
async fn upload_audio(
    State(service): State<GuardedUploadService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut metadata: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read multipart request: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "Malformed multipart request");
            }
        };

        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            AUDIO_FILE_FIELD => {
                let filename = field
                    .file_name()
                    .filter(|f| !f.is_empty())
                    .unwrap_or(FALLBACK_FILENAME)
                    .to_string();
                let content_type = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, content_type, bytes.to_vec())),
                    Err(e) => {
                        warn!("Failed to read audio file data: {}", e);
                        return error_response(StatusCode::BAD_REQUEST, "Failed to read file");
                    }
                }
            }
            METADATA_FIELD => match field.text().await {
                Ok(text) => metadata = Some(text),
                Err(e) => warn!("Ignoring unreadable metadata field: {}", e),
            },
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    let Some((filename, content_type, data)) = file else {
        return error_response(StatusCode::BAD_REQUEST, "No audio file provided");
    };

    let mut submission = RawAudioSubmission::new(data, filename);
    if let Some(content_type) = content_type {
        submission = submission.with_content_type(content_type);
    }
    if let Some(session_id) = session_id {
        submission = submission.with_session_id(session_id);
    }
    if let Some(metadata) = metadata {
        submission = submission.with_metadata_json(metadata);
    }

    match service.ingest(submission).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => {
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_response(status, e.public_message())
        }
    }
}

/// GET /health - Audio service health
async fn audio_health(State(service): State<GuardedUploadService>) -> impl IntoResponse {
    let store = service.store();
    Json(AudioHealthResponse {
        status: "healthy",
        service: "audio",
        storage_backend: store.backend().to_string(),
        container: store.container().to_string(),
    })
}

pub fn audio_routes(max_body_bytes: usize) -> Router<ServerState> {
    // Actual limit is enforced by AudioUploadService config
    let upload_route = Router::new()
        .route("/upload", post(upload_audio))
        .layer(DefaultBodyLimit::max(max_body_bytes));

    Router::new()
        .merge(upload_route)
        .route("/health", get(audio_health))
}
