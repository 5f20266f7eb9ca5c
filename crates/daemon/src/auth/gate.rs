use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use common::prelude::UnverifiedClaims;

use super::key_cache::PublicKeyCache;

/// The headers of an inbound request that a token is checked against.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext<'a> {
    pub origin: Option<&'a str>,
    pub host: Option<&'a str>,
    pub forwarded_host: Option<&'a str>,
}

/// Origin of a request whose token passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedOrigin(pub String);

#[derive(Debug, Deserialize)]
struct VerifiedClaims {
    #[serde(default)]
    aud: Option<String>,
    #[serde(default)]
    origin: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing X-Probe-Auth token")]
    MissingToken,
    #[error("no public key available to verify tokens")]
    KeyUnavailable,
    #[error("cached public key is not a valid RSA key: {0}")]
    BadKey(#[source] jsonwebtoken::errors::Error),
    #[error("invalid token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("token has no audience")]
    MissingAudience,
    #[error("missing Origin header or token origin")]
    MissingOrigin,
    #[error("origin mismatch: token {token:?}, request {request:?}")]
    OriginMismatch { token: String, request: String },
    #[error("audience {audience:?} matches neither host {host:?} nor forwarded host {forwarded_host:?}")]
    AudienceMismatch {
        audience: String,
        host: String,
        forwarded_host: String,
    },
}

/// Verifies inbound controller-signed tokens.
///
/// Tokens are RS256 JWTs carrying an audience (the probe host they were
/// issued for) and an origin (the page allowed to present them). A token is
/// accepted only when its signature verifies against the controller key, the
/// request `Origin` equals the token origin exactly, and the audience (minus
/// scheme) appears in `Host` or `X-Forwarded-Host`.
#[derive(Debug, Clone)]
pub struct TokenAuthGate {
    keys: Arc<PublicKeyCache>,
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

impl TokenAuthGate {
    pub fn new(keys: Arc<PublicKeyCache>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Arc<PublicKeyCache> {
        &self.keys
    }

    /// Boolean form of [`authorize`](Self::authorize). Failures are logged
    /// and reported as `false`.
    pub async fn verify(&self, token: Option<&str>, request: &RequestContext<'_>) -> bool {
        match self.authorize(token, request).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("probe auth rejected: {}", e);
                false
            }
        }
    }

    pub async fn authorize(
        &self,
        token: Option<&str>,
        request: &RequestContext<'_>,
    ) -> Result<VerifiedOrigin, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        // the unverified issuer only selects which key to load
        let hint = UnverifiedClaims::peek(token).and_then(|claims| claims.iss);
        let key = self
            .keys
            .ensure_fresh(hint.as_deref())
            .await
            .ok_or(AuthError::KeyUnavailable)?;

        let decoding_key = DecodingKey::from_rsa_pem(key.pem.as_bytes()).map_err(AuthError::BadKey)?;
        let mut validation = Validation::new(Algorithm::RS256);
        // audience is matched against the Host header below, not a fixed value
        validation.validate_aud = false;
        // `exp` is enforced when present but not required
        validation.required_spec_claims.clear();

        let claims = decode::<VerifiedClaims>(token, &decoding_key, &validation)
            .map_err(AuthError::InvalidToken)?
            .claims;

        let audience = claims
            .aud
            .filter(|a| !a.is_empty())
            .ok_or(AuthError::MissingAudience)?;

        let request_origin = request.origin.filter(|o| !o.is_empty());
        let token_origin = claims.origin.filter(|o| !o.is_empty());
        let (request_origin, token_origin) = match (request_origin, token_origin) {
            (Some(request), Some(token)) => (request, token),
            _ => return Err(AuthError::MissingOrigin),
        };
        if request_origin != token_origin {
            return Err(AuthError::OriginMismatch {
                token: token_origin,
                request: request_origin.to_string(),
            });
        }

        let audience_host = strip_scheme(&audience);
        let matches = |header: Option<&str>| {
            !audience_host.is_empty()
                && header.is_some_and(|h| !h.is_empty() && h.contains(audience_host))
        };
        if !matches(request.host) && !matches(request.forwarded_host) {
            return Err(AuthError::AudienceMismatch {
                audience: audience.clone(),
                host: request.host.unwrap_or_default().to_string(),
                forwarded_host: request.forwarded_host.unwrap_or_default().to_string(),
            });
        }

        Ok(VerifiedOrigin(request_origin.to_string()))
    }
}
