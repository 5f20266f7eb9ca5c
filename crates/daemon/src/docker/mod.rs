//! Local container runtime access.
//!
//! The runtime exposes an HTTP API on a Unix domain socket. The agent needs
//! two calls from it: restart a container, and read the tail of its logs.

mod client;
mod error;

use async_trait::async_trait;

pub use client::{ControlSocketClient, SocketResponse, DEFAULT_SOCKET_PATH};
pub use error::ControlSocketError;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `POST /containers/{name}/restart`
    async fn restart(&self, name: &str) -> Result<(), ControlSocketError>;

    /// The last 100 lines of both streams, timestamped, decoded to text.
    /// A non-200 answer (unknown container, TTY container) is an empty log.
    async fn logs(&self, name: &str) -> Result<String, ControlSocketError>;
}

/// Container names as the runtime accepts them: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn validate_container_name(name: &str) -> Result<&str, ControlSocketError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(name)
    } else {
        Err(ControlSocketError::InvalidName(name.to_string()))
    }
}
