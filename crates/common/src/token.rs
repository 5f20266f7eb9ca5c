//! Access tokens and best-effort payload inspection.
//!
//! Tokens issued by the controller are compact JWS strings
//! (`header.payload.signature`). [`UnverifiedClaims::peek`] reads the payload
//! segment WITHOUT checking the signature. Whatever it returns is attacker
//! controlled: it may pick which key to fetch or which `Origin` to present,
//! but it must never decide whether a request is authorized.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::Deserialize;

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A bearer credential obtained from the controller.
///
/// Lives for one sync cycle or one test run. `Debug` and `Display` are
/// redacted so the token cannot end up in logs by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Returns `None` for empty or whitespace-only tokens.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Unverified view of the payload.
    pub fn peek(&self) -> Option<UnverifiedClaims> {
        UnverifiedClaims::peek(&self.0)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

impl std::fmt::Display for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// The payload claims we care about, read without verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UnverifiedClaims {
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
}

impl UnverifiedClaims {
    /// Decode the middle segment of a three-part token.
    ///
    /// Returns `None` for anything that is not exactly three segments with a
    /// base64url JSON object in the middle. Non-string claim values are
    /// treated as absent.
    pub fn peek(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let bytes = PAYLOAD_ENGINE.decode(payload).ok()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        let object = value.as_object()?;

        let text = |key: &str| {
            object
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Some(Self {
            iss: text("iss"),
            aud: text("aud"),
            origin: text("origin"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn token_with(payload: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_peek_reads_claims() {
        let token = token_with(
            r#"{"iss":"https://central.example","aud":"https://probe.example","origin":"https://central.example","exp":1}"#,
        );
        let claims = UnverifiedClaims::peek(&token).unwrap();
        assert_eq!(claims.iss.as_deref(), Some("https://central.example"));
        assert_eq!(claims.aud.as_deref(), Some("https://probe.example"));
        assert_eq!(claims.origin.as_deref(), Some("https://central.example"));
    }

    #[test]
    fn test_peek_accepts_padded_payload() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"iss":"x"}"#);
        let token = format!("h.{}.s", payload);
        assert_eq!(UnverifiedClaims::peek(&token).unwrap().iss.as_deref(), Some("x"));
    }

    #[test]
    fn test_peek_rejects_malformed() {
        assert!(UnverifiedClaims::peek("").is_none());
        assert!(UnverifiedClaims::peek("a.b").is_none());
        assert!(UnverifiedClaims::peek("a.b.c.d").is_none());
        assert!(UnverifiedClaims::peek("a.!!!.c").is_none());
        assert!(UnverifiedClaims::peek(&token_with("[1,2]")).is_none());
    }

    #[test]
    fn test_peek_ignores_non_string_claims() {
        let claims = UnverifiedClaims::peek(&token_with(r#"{"iss":42,"aud":["a"]}"#)).unwrap();
        assert_eq!(claims, UnverifiedClaims::default());
    }

    #[test]
    fn test_access_token_is_redacted() {
        let token = AccessToken::new("secret.value.here").unwrap();
        assert_eq!(format!("{:?}", token), "AccessToken(<redacted>)");
        assert_eq!(token.to_string(), "<redacted>");
        assert_eq!(token.expose(), "secret.value.here");
        assert!(AccessToken::new("  ").is_none());
    }
}
