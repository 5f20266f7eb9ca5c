use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, ORIGIN};
use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

use common::measurement::throughput_mbps;
use common::prelude::{AccessToken, LatencySummary, MeasurementSample};

use super::{SpeedtestError, SpeedtestPlan, DOWNLOAD_PATH, ECHO_PATH};
use crate::controller::{ControllerApi, PROBE_AUTH_HEADER};

/// Runs the latency, download and upload phases against a target probe.
pub struct SpeedtestRunner {
    controller: Arc<dyn ControllerApi>,
    client: Client,
    plan: SpeedtestPlan,
}

impl SpeedtestRunner {
    pub fn new(controller: Arc<dyn ControllerApi>) -> Result<Self, SpeedtestError> {
        let client = Client::builder().tcp_nodelay(true).build()?;
        Ok(Self {
            controller,
            client,
            plan: SpeedtestPlan::default(),
        })
    }

    pub fn with_plan(mut self, plan: SpeedtestPlan) -> Self {
        self.plan = plan;
        self
    }

    pub async fn run(&self, server_url: &str) -> Result<MeasurementSample, SpeedtestError> {
        let target = server_url.trim().trim_end_matches('/');
        Url::parse(target).map_err(|_| SpeedtestError::InvalidTarget(server_url.to_string()))?;
        tracing::info!(target = %target, "starting speed test");

        let token = match self.controller.request_token(target).await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(target = %target, "proceeding without token: {}", e);
                None
            }
        };
        let headers = request_headers(token.as_ref(), self.controller.base_url());

        let echo_url = format!("{}{}", target, ECHO_PATH);
        let latency = self.measure_latency(&echo_url, &headers).await?;

        let (down_bytes, down_elapsed) = self
            .measure_download(&format!("{}{}", target, DOWNLOAD_PATH), &headers)
            .await;
        let (up_bytes, up_elapsed) = self.measure_upload(&echo_url, &headers).await;

        let sample = MeasurementSample {
            ping: latency.ping,
            jitter: latency.jitter,
            download: throughput_mbps(down_bytes, down_elapsed),
            upload: throughput_mbps(up_bytes, up_elapsed),
        };
        tracing::info!(
            target = %target,
            ping = sample.ping,
            jitter = sample.jitter,
            download = sample.download,
            upload = sample.upload,
            "speed test finished"
        );
        Ok(sample)
    }

    async fn measure_latency(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<LatencySummary, SpeedtestError> {
        let mut samples = Vec::with_capacity(self.plan.ping_samples);
        for _ in 0..self.plan.ping_samples {
            let start = Instant::now();
            let response = self.client.get(url).headers(headers.clone()).send().await?;
            samples.push(start.elapsed().as_secs_f64() * 1000.0);

            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(SpeedtestError::Unauthorized);
            }
            let _ = response.bytes().await;
        }
        Ok(LatencySummary::from_samples(&samples))
    }

    /// Parallel streaming downloads, all cancelled by one deadline signal.
    async fn measure_download(&self, url: &str, headers: &HeaderMap) -> (u64, Duration) {
        let received = Arc::new(AtomicU64::new(0));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let start = Instant::now();
        let deadline = self.plan.download_duration;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = cancel_tx.send(true);
        });

        let workers = (0..self.plan.connections).map(|_| {
            download_worker(
                self.client.clone(),
                url.to_string(),
                headers.clone(),
                received.clone(),
                cancel_rx.clone(),
            )
        });
        join_all(workers).await;
        let elapsed = start.elapsed();
        timer.abort();

        (received.load(Ordering::Relaxed), elapsed)
    }

    /// Parallel upload loops. A request in flight at the deadline may finish
    /// and is counted; the phase lasts until every worker has returned.
    async fn measure_upload(&self, url: &str, headers: &HeaderMap) -> (u64, Duration) {
        let sent = Arc::new(AtomicU64::new(0));
        let payload = Bytes::from(vec![0u8; self.plan.upload_chunk_size]);

        let start = Instant::now();
        let deadline = start + self.plan.upload_duration;
        let request_timeout = self.plan.upload_duration.max(Duration::from_secs(1));

        let workers = (0..self.plan.connections).map(|_| {
            let client = self.client.clone();
            let headers = headers.clone();
            let payload = payload.clone();
            let sent = sent.clone();
            async move {
                while Instant::now() < deadline {
                    let result = client
                        .post(url)
                        .headers(headers.clone())
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .timeout(request_timeout)
                        .body(payload.clone())
                        .send()
                        .await;
                    match result {
                        Ok(response) => {
                            sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
                            let _ = response.bytes().await;
                        }
                        Err(e) => {
                            tracing::debug!("upload worker stopped: {}", e);
                            break;
                        }
                    }
                }
            }
        });
        join_all(workers).await;

        (sent.load(Ordering::Relaxed), start.elapsed())
    }
}

async fn download_worker(
    client: Client,
    url: String,
    headers: HeaderMap,
    received: Arc<AtomicU64>,
    mut cancel: watch::Receiver<bool>,
) {
    let response = tokio::select! {
        result = client.get(&url).headers(headers).send() => match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!(status = %response.status(), "download refused");
                return;
            }
            Err(e) => {
                tracing::debug!("download request failed: {}", e);
                return;
            }
        },
        _ = cancelled(&mut cancel) => return,
    };

    let mut body = response.bytes_stream();
    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(chunk)) => {
                    received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Some(Err(e)) => {
                    tracing::debug!("download stream ended early: {}", e);
                    break;
                }
                None => break,
            },
            _ = cancelled(&mut cancel) => break,
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Headers presented to the target: the token's bound origin when it names
/// one, else the controller's URL, plus the token itself.
fn request_headers(token: Option<&AccessToken>, controller_origin: &str) -> HeaderMap {
    let origin = token
        .and_then(|t| t.peek())
        .and_then(|claims| claims.origin)
        .unwrap_or_else(|| controller_origin.to_string());

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(ORIGIN, value);
    }
    if let Some(token) = token {
        if let Ok(value) = HeaderValue::from_str(token.expose()) {
            headers.insert(PROBE_AUTH_HEADER, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    use super::*;

    fn unsigned_token(payload: serde_json::Value) -> AccessToken {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
        AccessToken::new(format!("{}.{}.c2ln", header, payload)).unwrap()
    }

    #[test]
    fn test_origin_comes_from_token() {
        let token = unsigned_token(serde_json::json!({"origin": "https://panel.example"}));
        let headers = request_headers(Some(&token), "https://central.example");

        assert_eq!(headers[ORIGIN], "https://panel.example");
        assert_eq!(headers[PROBE_AUTH_HEADER], token.expose());
    }

    #[test]
    fn test_origin_falls_back_to_controller() {
        let token = unsigned_token(serde_json::json!({"aud": "https://probe.example"}));
        let headers = request_headers(Some(&token), "https://central.example");
        assert_eq!(headers[ORIGIN], "https://central.example");

        let headers = request_headers(None, "https://central.example");
        assert_eq!(headers[ORIGIN], "https://central.example");
        assert!(!headers.contains_key(PROBE_AUTH_HEADER));
    }

    #[test]
    fn test_default_plan() {
        let plan = SpeedtestPlan::default();
        assert_eq!(plan.ping_samples, 5);
        assert_eq!(plan.connections, 6);
        assert_eq!(plan.download_duration, Duration::from_secs(5));
        assert_eq!(plan.upload_chunk_size, 4 * 1024 * 1024);
    }
}
