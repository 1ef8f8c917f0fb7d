use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use crate::audio::AudioUploadService;

use super::ServerConfig;

pub type GuardedUploadService = Arc<AudioUploadService>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub upload_service: GuardedUploadService,
    pub hash: String,
}

impl ServerState {
    pub fn new(config: ServerConfig, upload_service: GuardedUploadService, hash: String) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            upload_service,
            hash,
        }
    }
}

impl FromRef<ServerState> for GuardedUploadService {
    fn from_ref(input: &ServerState) -> Self {
        input.upload_service.clone()
    }
}
