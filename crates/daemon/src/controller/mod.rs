//! Client side of the controller contract.
//!
//! The controller itself is a black box reachable over HTTP. The agent and
//! the test driver only ever talk to it through [`ControllerApi`], which keeps
//! the sync cycle testable against an in-memory fake.

mod client;
mod error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::prelude::{AccessToken, ManifestResponse};

pub use client::ControllerClient;
pub use error::ControllerError;

/// Header carrying the access token on authenticated calls.
pub const PROBE_AUTH_HEADER: &str = "x-probe-auth";

/// One log line (or batch of lines) shipped to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub code: String,
    pub message: String,
}

impl LogRecord {
    /// A harvested container log, tagged with its source container.
    pub fn container_logs(container: &str, message: String) -> Self {
        Self {
            level: "info".to_string(),
            code: format!("docker_logs:{}", container),
            message,
        }
    }
}

#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Base URL requests are sent to, also used as the `Origin` header.
    fn base_url(&self) -> &str;

    /// `POST /probe/token` for a token scoped to `host`.
    async fn request_token(&self, host: &str) -> Result<AccessToken, ControllerError>;

    /// `GET /probe/update/files`. Malformed bodies yield an empty manifest.
    async fn fetch_manifest(&self, token: &AccessToken)
        -> Result<ManifestResponse, ControllerError>;

    /// `POST /probe/log`.
    async fn send_log(&self, token: &AccessToken, record: &LogRecord)
        -> Result<(), ControllerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_log_record() {
        let record = LogRecord::container_logs("nginx-proxy", "line\n".into());
        assert_eq!(record.level, "info");
        assert_eq!(record.code, "docker_logs:nginx-proxy");
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::json!({"level": "info", "code": "docker_logs:nginx-proxy", "message": "line\n"})
        );
    }
}
