use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use common::log_frame::decode_text;

use super::error::ControlSocketError;
use super::{validate_container_name, ContainerRuntime};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Restarts wait for the container to stop, so allow well over the
/// runtime's default stop timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Query used for log harvesting: both streams, last 100 lines, timestamps.
const LOGS_QUERY: &str = "stdout=1&stderr=1&tail=100&timestamps=1";

#[derive(Debug, Clone)]
pub struct SocketResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Minimal HTTP/1.1 client for the runtime's Unix control socket.
///
/// One connection per request; the runtime API is cheap to dial and the
/// agent issues a handful of calls per cycle.
#[derive(Debug, Clone)]
pub struct ControlSocketClient {
    socket_path: PathBuf,
}

impl Default for ControlSocketClient {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

impl ControlSocketClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Issue one request and read the whole response body.
    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
    ) -> Result<SocketResponse, ControlSocketError> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.request_inner(method, path_and_query))
            .await
            .map_err(|_| ControlSocketError::Timeout)?
    }

    async fn request_inner(
        &self,
        method: Method,
        path_and_query: &str,
    ) -> Result<SocketResponse, ControlSocketError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("control socket connection closed with error: {}", e);
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(HOST, "localhost")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        Ok(SocketResponse { status, body })
    }
}

#[async_trait]
impl ContainerRuntime for ControlSocketClient {
    async fn restart(&self, name: &str) -> Result<(), ControlSocketError> {
        let name = validate_container_name(name)?;
        tracing::info!(container = name, "restarting container");

        let response = self
            .request(Method::POST, &format!("/containers/{}/restart", name))
            .await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(ControlSocketError::HttpStatus(
                response.status,
                String::from_utf8_lossy(&response.body).into_owned(),
            ))
        }
    }

    async fn logs(&self, name: &str) -> Result<String, ControlSocketError> {
        let name = validate_container_name(name)?;
        let response = self
            .request(
                Method::GET,
                &format!("/containers/{}/logs?{}", name, LOGS_QUERY),
            )
            .await?;

        if response.status != StatusCode::OK {
            tracing::debug!(container = name, status = %response.status, "no logs available");
            return Ok(String::new());
        }
        Ok(decode_text(&response.body))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::log_frame::encode_frame;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    use super::*;

    /// Answers every connection with a canned response and records the
    /// request lines it saw.
    fn fake_runtime(
        dir: &tempfile::TempDir,
        status_line: &'static str,
        body: Vec<u8>,
    ) -> (PathBuf, Arc<Mutex<Vec<String>>>) {
        let path = dir.path().join("runtime.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_server = seen.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&head).into_owned();
                seen_by_server
                    .lock()
                    .push(head.lines().next().unwrap_or_default().to_string());

                let mut response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status_line,
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(&body);
                stream.write_all(&response).await.unwrap();
                stream.shutdown().await.ok();
            }
        });

        (path, seen)
    }

    #[tokio::test]
    async fn test_restart_posts_to_container() {
        let dir = tempfile::tempdir().unwrap();
        let (path, seen) = fake_runtime(&dir, "204 No Content", Vec::new());

        ControlSocketClient::new(&path)
            .restart("speedtest-probe")
            .await
            .unwrap();
        assert_eq!(
            seen.lock().as_slice(),
            ["POST /containers/speedtest-probe/restart HTTP/1.1"]
        );
    }

    #[tokio::test]
    async fn test_restart_failure_surfaces_status() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = fake_runtime(&dir, "404 Not Found", b"no such container".to_vec());

        let err = ControlSocketClient::new(&path)
            .restart("missing")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlSocketError::HttpStatus(StatusCode::NOT_FOUND, _)
        ));
    }

    #[tokio::test]
    async fn test_logs_are_demultiplexed() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = encode_frame(1, b"2024-01-01T00:00:00Z started\n");
        body.extend(encode_frame(2, b"2024-01-01T00:00:01Z warn\n"));
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0]);
        let (path, seen) = fake_runtime(&dir, "200 OK", body);

        let logs = ControlSocketClient::new(&path)
            .logs("nginx-proxy")
            .await
            .unwrap();
        assert_eq!(
            logs,
            "2024-01-01T00:00:00Z started\n2024-01-01T00:00:01Z warn\n"
        );
        assert_eq!(
            seen.lock().as_slice(),
            ["GET /containers/nginx-proxy/logs?stdout=1&stderr=1&tail=100&timestamps=1 HTTP/1.1"]
        );
    }

    #[tokio::test]
    async fn test_logs_non_200_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = fake_runtime(&dir, "404 Not Found", b"{}".to_vec());

        let logs = ControlSocketClient::new(&path).logs("gone").await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_socket_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlSocketClient::new(dir.path().join("nope.sock"));
        assert!(matches!(
            client.restart("speedtest-probe").await,
            Err(ControlSocketError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_name_never_dials() {
        let client = ControlSocketClient::new("/nonexistent.sock");
        assert!(matches!(
            client.logs("../etc").await,
            Err(ControlSocketError::InvalidName(_))
        ));
    }
}
