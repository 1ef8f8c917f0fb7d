use anyhow::{Context, Result};
use axum::{extract::State, middleware, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::audio_routes::audio_routes;
use super::{log_requests, state::ServerState, ServerConfig};
use crate::audio::AudioUploadService;

#[derive(Serialize)]
struct ServerStats {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime: String,
    pub hash: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ServerStats {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
    })
}

pub fn make_app(state: ServerState) -> Router {
    let audio = audio_routes(state.config.max_body_bytes).with_state(state.clone());

    let home_router: Router = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());

    home_router.nest("/audio", audio).layer(middleware::from_fn_with_state(
        state.config.requests_logging_level.clone(),
        log_requests,
    ))
}

pub async fn run_server(
    config: ServerConfig,
    upload_service: Arc<AudioUploadService>,
    hash: String,
) -> Result<()> {
    let port = config.port;
    let app = make_app(ServerState::new(config, upload_service, hash));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on {}", listener.local_addr()?);

    Ok(axum::serve(listener, app).await?)
}
