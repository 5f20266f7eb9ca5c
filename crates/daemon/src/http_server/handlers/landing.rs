use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use common::prelude::{build_info, BuildInfo};

use crate::ServiceState;

pub const LANDING_FILE: &str = "landing.html";
pub const LOGO_FILE: &str = "logo.png";

const FALLBACK_LANDING: &str = "<h1>Speedtest Probe Active (Landing page missing)</h1>";

pub async fn index_handler(State(state): State<ServiceState>) -> Response {
    let path = state.config().static_dir.join(LANDING_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            tracing::debug!(path = ?path, "serving fallback landing page: {}", e);
            Html(FALLBACK_LANDING).into_response()
        }
    }
}

/// Unknown routes. JSON clients get the same `{error}` shape the API uses.
pub async fn not_found_handler(headers: HeaderMap) -> Response {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    if wants_json {
        let msg = serde_json::json!({"error": "Not found"});
        (StatusCode::NOT_FOUND, Json(msg)).into_response()
    } else {
        (StatusCode::NOT_FOUND, "Not found").into_response()
    }
}

pub async fn logo_handler(State(state): State<ServiceState>) -> Response {
    let path = state.config().static_dir.join(LOGO_FILE);
    match tokio::fs::read(&path).await {
        Ok(logo) => ([(header::CONTENT_TYPE, "image/png")], logo).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    /// Whether a landing page is installed
    pub landing: bool,
    pub cwd: String,
    pub build: BuildInfo,
}

pub async fn version_handler(State(state): State<ServiceState>) -> Json<VersionResponse> {
    let build = build_info();
    let landing = tokio::fs::try_exists(state.config().static_dir.join(LANDING_FILE))
        .await
        .unwrap_or(false);
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();

    Json(VersionResponse {
        version: build.crate_version,
        landing,
        cwd,
        build,
    })
}
