use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse};
use tower_http::LatencyUnit;

mod config;
pub mod handlers;
mod middleware;

pub use config::Config;
pub use handlers::measure::GarbageStream;

use crate::auth::require_probe_auth;
use crate::ServiceState;

/// Routes that carry measurement traffic, optionally behind token auth.
fn measurement_router(state: &ServiceState) -> Router<ServiceState> {
    let router = Router::new()
        .route("/empty", any(handlers::measure::empty_handler))
        .route("/empty.php", any(handlers::measure::empty_handler))
        .route("/garbage", get(handlers::measure::garbage_handler))
        .route("/garbage.php", get(handlers::measure::garbage_handler))
        .layer(DefaultBodyLimit::disable());

    if state.config().require_auth {
        tracing::info!("measurement routes require a probe token");
        router.route_layer(axum::middleware::from_fn_with_state(
            state.gate().clone(),
            require_probe_auth,
        ))
    } else {
        router
    }
}

/// The full probe application without transport concerns.
pub fn router(state: ServiceState) -> Router {
    let router = Router::new()
        .merge(measurement_router(&state))
        .route("/", get(handlers::landing::index_handler))
        .route("/logo.png", get(handlers::landing::logo_handler))
        .route("/version", get(handlers::landing::version_handler))
        .route("/ip", get(handlers::ip::handler))
        .route("/api/test", post(handlers::api_test::handler))
        .fallback(handlers::not_found_handler)
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::permissive_cors));

    middleware::with_security_headers(router)
}

/// Bind the configured address and serve until shutdown.
pub async fn run(
    config: Config,
    state: ServiceState,
    shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    serve(listener, config, state, shutdown_rx).await
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    state: ServiceState,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .level(config.log_level)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    let app = router(state).layer(trace_layer);

    tracing::info!(addr = ?listener.local_addr()?, "probe server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .tcp_nodelay(true)
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}
