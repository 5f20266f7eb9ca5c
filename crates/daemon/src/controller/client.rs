use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use common::prelude::{AccessToken, ManifestResponse};

use super::error::ControllerError;
use super::{ControllerApi, LogRecord, PROBE_AUTH_HEADER};
use crate::auth::PublicKeyFetcher;

/// Every controller call is abandoned after this long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const PEM_MARKER: &str = "BEGIN PUBLIC KEY";

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    host: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

/// HTTP client for the controller.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    base_url: String,
    client: Client,
}

impl ControllerClient {
    pub fn new(base_url: &str) -> Result<Self, ControllerError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();

        let mut default_headers = HeaderMap::new();
        if let Ok(origin) = HeaderValue::from_str(&base_url) {
            default_headers.insert(ORIGIN, origin);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { base_url, client })
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    fn url(&self, path: &str) -> Result<String, ControllerError> {
        if !self.is_configured() {
            return Err(ControllerError::NotConfigured);
        }
        Ok(format!("{}{}", self.base_url, path))
    }

    async fn send(request: RequestBuilder) -> Result<Response, ControllerError> {
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ControllerError::HttpStatus(status, body))
        }
    }
}

#[async_trait]
impl ControllerApi for ControllerClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request_token(&self, host: &str) -> Result<AccessToken, ControllerError> {
        let request = self
            .client
            .post(self.url("/probe/token")?)
            .json(&TokenRequest { host });

        let response: TokenResponse = Self::send(request).await?.json().await?;
        response
            .token
            .and_then(AccessToken::new)
            .ok_or(ControllerError::MissingToken)
    }

    async fn fetch_manifest(
        &self,
        token: &AccessToken,
    ) -> Result<ManifestResponse, ControllerError> {
        let request = self
            .client
            .get(self.url("/probe/update/files")?)
            .header(PROBE_AUTH_HEADER, token.expose());

        let body = Self::send(request).await?.bytes().await?;
        Ok(ManifestResponse::parse_lenient(&body))
    }

    async fn send_log(&self, token: &AccessToken, record: &LogRecord) -> Result<(), ControllerError> {
        let request = self
            .client
            .post(self.url("/probe/log")?)
            .header(PROBE_AUTH_HEADER, token.expose())
            .json(record);

        Self::send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl PublicKeyFetcher for ControllerClient {
    async fn fetch_public_key(&self, issuer: &str) -> Result<String, ControllerError> {
        let base = issuer.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(ControllerError::NotConfigured);
        }

        let request = self.client.get(format!("{}/probe/pubkey", base));
        let pem = Self::send(request).await?.text().await?;
        if pem.contains(PEM_MARKER) {
            Ok(pem)
        } else {
            Err(ControllerError::InvalidPublicKey)
        }
    }
}
