use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::Bytes;

use crate::auth::{PublicKeyCache, TokenAuthGate};
use crate::controller::{ControllerClient, ControllerError};
use crate::speedtest::{SpeedtestError, SpeedtestRunner};
use crate::ServiceConfig;

/// Shared state of the HTTP server. Cheap to clone.
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    controller: Arc<ControllerClient>,
    gate: Arc<TokenAuthGate>,
    garbage: Bytes,
    active_downloads: Arc<AtomicUsize>,
    speedtest: SpeedtestRunner,
    http: reqwest::Client,
}

impl State {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, StateSetupError> {
        let controller = Arc::new(ControllerClient::new(&config.central_url)?);

        let keys = PublicKeyCache::new(
            &config.central_url,
            &config.trusted_issuers,
            &config.static_keys,
            controller.clone(),
        );
        let gate = Arc::new(TokenAuthGate::new(Arc::new(keys)));

        // Content is irrelevant, only the size matters
        let garbage = Bytes::from(vec![0u8; config.garbage_chunk_size.max(1)]);
        tracing::debug!(bytes = garbage.len(), "allocated download buffer");

        let speedtest = SpeedtestRunner::new(controller.clone())?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(ControllerError::from)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                controller,
                gate,
                garbage,
                active_downloads: Arc::default(),
                speedtest,
                http,
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn controller(&self) -> &Arc<ControllerClient> {
        &self.inner.controller
    }

    pub fn gate(&self) -> &Arc<TokenAuthGate> {
        &self.inner.gate
    }

    /// The reusable buffer `/garbage` streams. Clones share the allocation.
    pub fn garbage(&self) -> &Bytes {
        &self.inner.garbage
    }

    /// `/garbage` streams currently open.
    pub fn active_downloads(&self) -> &Arc<AtomicUsize> {
        &self.inner.active_downloads
    }

    pub fn speedtest(&self) -> &SpeedtestRunner {
        &self.inner.speedtest
    }

    /// Client for outbound lookups that are not controller calls.
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("failed to set up controller client: {0}")]
    Controller(#[from] ControllerError),
    #[error("failed to set up speed test client: {0}")]
    Speedtest(#[from] SpeedtestError),
}
