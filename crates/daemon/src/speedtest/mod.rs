//! Driving side of the measurement engine.
//!
//! [`SpeedtestRunner`] measures latency, download and upload throughput
//! against any probe exposing `/empty` and `/garbage`, authenticating with a
//! token obtained from the controller when one is available.

mod runner;

use std::time::Duration;

pub use runner::SpeedtestRunner;

/// Round trips used for ping and jitter.
pub const PING_SAMPLES: usize = 5;
/// Parallel connections for each throughput phase.
pub const CONNECTIONS: usize = 6;
/// Wall-clock length of each throughput phase.
pub const PHASE_DURATION: Duration = Duration::from_secs(5);
/// Payload sent by every upload request.
pub const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub const ECHO_PATH: &str = "/empty";
pub const DOWNLOAD_PATH: &str = "/garbage";

/// Fixed policy for one run. Nothing here adapts to measured conditions.
#[derive(Debug, Clone)]
pub struct SpeedtestPlan {
    pub ping_samples: usize,
    pub connections: usize,
    pub download_duration: Duration,
    pub upload_duration: Duration,
    pub upload_chunk_size: usize,
}

impl Default for SpeedtestPlan {
    fn default() -> Self {
        Self {
            ping_samples: PING_SAMPLES,
            connections: CONNECTIONS,
            download_duration: PHASE_DURATION,
            upload_duration: PHASE_DURATION,
            upload_chunk_size: UPLOAD_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpeedtestError {
    #[error("invalid server url: {0}")]
    InvalidTarget(String),
    #[error("Unauthorized (token invalid or missing)")]
    Unauthorized,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}
