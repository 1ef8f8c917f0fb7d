//! Shared constants for end-to-end tests

#![allow(dead_code)]

/// Upload limit configured on test servers.
pub const TEST_MAX_UPLOAD_BYTES: u64 = 4096;

/// Prefix the test probe treats as a valid audio stream.
pub const AUDIO_MAGIC: &[u8] = b"AUDIO";

pub const TEST_CONTAINER: &str = "audio";

pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;
pub const REQUEST_TIMEOUT_SECS: u64 = 10;
