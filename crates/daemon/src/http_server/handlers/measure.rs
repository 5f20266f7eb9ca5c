//! Latency echo, upload sink and download generator.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderName};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::ServiceState;

pub const NO_STORE: &str = "no-store, no-cache, must-revalidate, max-age=0";

pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Headers shared by every measurement response.
pub fn measurement_headers() -> [(HeaderName, &'static str); 3] {
    [
        (header::CACHE_CONTROL, NO_STORE),
        (X_ACCEL_BUFFERING, "no"),
        (header::ACCEPT_RANGES, "none"),
    ]
}

/// `/empty`: answers `OK` at once, except for `POST` where the whole request
/// body is consumed first so upload timing covers the full transfer.
pub async fn empty_handler(method: Method, body: Body) -> Response {
    if method == Method::HEAD {
        return (StatusCode::OK, measurement_headers()).into_response();
    }

    if method == Method::POST {
        let mut received: u64 = 0;
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => received += chunk.len() as u64,
                Err(e) => {
                    tracing::debug!(received, "upload aborted: {}", e);
                    return StatusCode::BAD_REQUEST.into_response();
                }
            }
        }
        tracing::trace!(received, "upload drained");
    }

    (StatusCode::OK, measurement_headers(), "OK").into_response()
}

/// `/garbage`: the shared buffer, repeated until the client goes away.
pub async fn garbage_handler(State(state): State<ServiceState>) -> Response {
    let stream = GarbageStream::tracked(state.garbage().clone(), state.active_downloads().clone());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        measurement_headers(),
        Body::from_stream(stream),
    )
        .into_response()
}

/// Endless body that yields the same buffer over and over.
///
/// Every item is a refcounted clone of one allocation. The connection only
/// polls for the next item once the previous one has been handed to the
/// socket, so a slow reader holds at most one buffer in flight. Dropping the
/// stream (client closed or aborted) ends the generator.
pub struct GarbageStream {
    chunk: Bytes,
    sent: u64,
    started: Instant,
    active: Option<Arc<AtomicUsize>>,
}

impl GarbageStream {
    pub fn new(chunk: Bytes) -> Self {
        Self {
            chunk,
            sent: 0,
            started: Instant::now(),
            active: None,
        }
    }

    /// Like [`new`](Self::new), counted in `active` for as long as the
    /// stream lives.
    pub fn tracked(chunk: Bytes, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            chunk,
            sent: 0,
            started: Instant::now(),
            active: Some(active),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Stream for GarbageStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.chunk.is_empty() {
            return Poll::Ready(None);
        }
        this.sent += this.chunk.len() as u64;
        Poll::Ready(Some(Ok(this.chunk.clone())))
    }
}

impl Drop for GarbageStream {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(
            bytes = self.sent,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "download stream closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use axum::routing::{any, get};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_garbage_stream_reuses_the_buffer() {
        let chunk = Bytes::from(vec![7u8; 1024]);
        let mut stream = GarbageStream::new(chunk.clone());

        for _ in 0..3 {
            let item = stream.next().await.unwrap().unwrap();
            assert_eq!(item.as_ptr(), chunk.as_ptr());
        }
        assert_eq!(stream.sent(), 3 * 1024);
    }

    #[tokio::test]
    async fn test_tracked_stream_releases_its_slot() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut first = GarbageStream::tracked(Bytes::from_static(b"abc"), active.clone());
        let second = GarbageStream::tracked(Bytes::from_static(b"abc"), active.clone());
        assert_eq!(active.load(Ordering::SeqCst), 2);

        first.next().await.unwrap().unwrap();
        drop(first);
        assert_eq!(active.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_buffer_ends_the_stream() {
        let mut stream = GarbageStream::new(Bytes::new());
        assert!(stream.next().await.is_none());
    }

    fn echo() -> Router {
        Router::new().route("/empty", any(empty_handler))
    }

    #[tokio::test]
    async fn test_echo_answers_ok() {
        let response = echo()
            .oneshot(Request::get("/empty").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], NO_STORE);
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        assert_eq!(response.headers()["accept-ranges"], "none");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_head_is_empty() {
        let response = echo()
            .oneshot(Request::head("/empty").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_post_drains_the_upload() {
        let upload = Body::from_stream(futures::stream::iter(
            (0..16).map(|_| Ok::<_, Infallible>(Bytes::from(vec![0u8; 64 * 1024]))),
        ));
        let response = echo()
            .oneshot(Request::post("/empty").body(upload).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_garbage_route_streams_octets() {
        let app = Router::new()
            .route("/garbage", get(|| async {
                Body::from_stream(GarbageStream::new(Bytes::from_static(b"0123456789")).take(4))
            }));
        let response = app
            .oneshot(Request::get("/garbage").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 40);
    }
}
