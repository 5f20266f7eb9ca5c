use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::gate::{RequestContext, TokenAuthGate};
use crate::controller::PROBE_AUTH_HEADER;

const FORWARDED_HOST: &str = "x-forwarded-host";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Rejects requests whose `X-Probe-Auth` token does not pass the gate.
///
/// `HEAD` requests carry no payload and pass through, so latency probes keep
/// working before a token has been issued. On success the verified origin is
/// stored as a request extension for handlers.
pub async fn require_probe_auth(
    State(gate): State<Arc<TokenAuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::HEAD {
        return next.run(request).await;
    }

    let headers = request.headers();
    let token = header_str(headers, PROBE_AUTH_HEADER);
    let context = RequestContext {
        origin: header_str(headers, header::ORIGIN.as_str()),
        host: header_str(headers, header::HOST.as_str()),
        forwarded_host: header_str(headers, FORWARDED_HOST),
    };

    match gate.authorize(token, &context).await {
        Ok(verified) => {
            request.extensions_mut().insert(verified);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), "unauthorized: {}", e);
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::{Extension, Router};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::gate::tests::{gate, mint, SIGNING_PEM};
    use crate::auth::VerifiedOrigin;

    fn app() -> Router {
        let gate = Arc::new(gate());
        Router::new()
            .route(
                "/empty",
                get(|Extension(origin): Extension<VerifiedOrigin>| async move { origin.0 }),
            )
            .layer(axum::middleware::from_fn_with_state(gate, require_probe_auth))
    }

    fn token() -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 600;
        mint(
            json!({
                "iss": "https://central.example",
                "aud": "https://probe-1.example",
                "origin": "https://central.example",
                "exp": exp,
            }),
            SIGNING_PEM,
        )
    }

    #[tokio::test]
    async fn test_rejects_without_token() {
        let response = app()
            .oneshot(Request::get("/empty").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_head_passes_through() {
        let app = Router::new()
            .route("/empty", axum::routing::head(|| async { StatusCode::OK }))
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(gate()),
                require_probe_auth,
            ));
        let response = app
            .oneshot(Request::head("/empty").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_records_verified_origin() {
        use http_body_util::BodyExt;

        let request = Request::get("/empty")
            .header(PROBE_AUTH_HEADER, token())
            .header(header::ORIGIN, "https://central.example")
            .header(header::HOST, "probe-1.example")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"https://central.example");
    }
}
