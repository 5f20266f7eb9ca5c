use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ControlSocketError {
    #[error("invalid container name {0:?}")]
    InvalidName(String),
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control socket HTTP error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
    #[error("control socket request timed out")]
    Timeout,
    #[error("runtime answered {0}: {1}")]
    HttpStatus(StatusCode, String),
}
