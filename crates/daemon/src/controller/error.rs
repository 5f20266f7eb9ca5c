use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller URL is not configured")]
    NotConfigured,
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, String),
    #[error("controller answered without a token")]
    MissingToken,
    #[error("controller returned something that is not a PEM public key")]
    InvalidPublicKey,
}
