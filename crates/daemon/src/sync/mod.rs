//! The self-updating sync agent.
//!
//! Each cycle authenticates to the controller, pulls the file manifest,
//! writes whatever changed, restarts the probe container when needed and
//! forwards the logs of the co-located containers. Cycles never overlap: the
//! loop waits for one to finish before the next tick is taken.

mod apply;
mod forwarder;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use common::prelude::AccessToken;

use crate::controller::ControllerApi;
use crate::docker::ContainerRuntime;

pub use apply::{write_if_changed, ApplyError, ApplyReport, Applier};
pub use forwarder::LogForwarder;

/// Delay between writing changed files and restarting the probe.
pub const RESTART_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Controller base URL. Empty disables the agent.
    pub central_url: String,
    /// Host the agent asks tokens for. Empty disables the agent.
    pub self_host: String,
    pub domain: String,
    pub interval: Duration,
    pub restart_delay: Duration,
    /// The only container restarted after an update
    pub probe_container: String,
    /// Containers whose logs are forwarded every cycle
    pub log_containers: Vec<String>,
    pub apply_dir: PathBuf,
    /// Manifest path of the agent's own executable
    pub self_path: String,
}

impl SyncConfig {
    /// Hosts to request a token for, in order, without duplicates.
    pub fn host_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        if !self.self_host.is_empty() {
            candidates.push(self.self_host.clone());
        }
        if !self.domain.is_empty() {
            let derived = format!("https://{}", self.domain);
            if !candidates.contains(&derived) {
                candidates.push(derived);
            }
        }
        candidates
    }

    /// Domain used to name the proxy vhost snippet.
    pub fn vhost_domain(&self) -> Option<String> {
        if !self.domain.is_empty() {
            return Some(self.domain.clone());
        }
        let host = strip_scheme(&self.self_host);
        (!host.is_empty()).then(|| host.to_string())
    }
}

/// Resolve the host the agent identifies as: the explicit self host, else
/// the domain. A trailing slash is dropped from URLs that carry a scheme.
pub fn resolve_self_host(self_host: &str, domain: &str) -> String {
    let raw = match self_host.trim() {
        "" => domain.trim(),
        explicit => explicit,
    };
    if has_scheme(raw) {
        raw.strip_suffix('/').unwrap_or(raw).to_string()
    } else {
        raw.to_string()
    }
}

fn has_scheme(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn strip_scheme(host: &str) -> &str {
    if !has_scheme(host) {
        return host;
    }
    host.split_once("://").map(|(_, rest)| rest).unwrap_or(host)
}

#[derive(Debug)]
pub struct CycleSummary {
    pub report: ApplyReport,
    /// A restart was requested and acknowledged
    pub restarted: bool,
    pub logs_forwarded: usize,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Controller URL or self host missing
    NotConfigured,
    /// No candidate host was granted a token
    NoToken,
    ManifestUnavailable,
    /// The blocking apply task died before reporting
    ApplyAborted,
    Applied(CycleSummary),
}

impl CycleOutcome {
    pub fn requires_self_restart(&self) -> bool {
        matches!(self, CycleOutcome::Applied(summary) if summary.report.self_changed)
    }
}

/// Why [`SyncAgent::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// The agent's own executable was replaced; the process should exit
    /// and let its supervisor start the new one.
    SelfUpdate,
}

pub struct SyncAgent {
    config: SyncConfig,
    controller: Arc<dyn ControllerApi>,
    runtime: Arc<dyn ContainerRuntime>,
    applier: Applier,
    forwarder: LogForwarder,
}

impl SyncAgent {
    pub fn new(
        config: SyncConfig,
        controller: Arc<dyn ControllerApi>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let applier = Applier::new(
            config.apply_dir.clone(),
            config.vhost_domain(),
            &config.self_path,
        );
        let forwarder = LogForwarder::new(config.log_containers.clone());
        Self {
            config,
            controller,
            runtime,
            applier,
            forwarder,
        }
    }

    /// Run cycles on the configured interval until shutdown or self-update.
    /// The first cycle starts immediately.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) -> LoopExit {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = period.as_millis() as u64,
            host = %self.config.self_host,
            "sync agent started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return LoopExit::Shutdown,
                _ = ticker.tick() => {}
            }

            // A panicking cycle only takes its own task down.
            let agent = self.clone();
            let mut cycle = tokio::spawn(async move { agent.run_cycle().await });
            let joined = tokio::select! {
                _ = shutdown_rx.changed() => {
                    cycle.abort();
                    return LoopExit::Shutdown;
                }
                joined = &mut cycle => joined,
            };

            match joined {
                Ok(outcome) if outcome.requires_self_restart() => {
                    tracing::info!("self-update detected, exiting for restart");
                    return LoopExit::SelfUpdate;
                }
                Ok(outcome) => tracing::debug!(?outcome, "sync cycle finished"),
                Err(e) => tracing::error!("sync cycle failed: {}", e),
            }
        }
    }

    /// One full cycle. Never fails; every problem is logged and reflected in
    /// the outcome.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.config.central_url.is_empty()
            || self.controller.base_url().is_empty()
            || self.config.self_host.is_empty()
        {
            return CycleOutcome::NotConfigured;
        }

        let token = match self.acquire_token().await {
            Some(token) => token,
            None => return CycleOutcome::NoToken,
        };

        let manifest = match self.controller.fetch_manifest(&token).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!("failed to fetch update manifest: {}", e);
                return CycleOutcome::ManifestUnavailable;
            }
        };

        let applier = self.applier.clone();
        let report = match tokio::task::spawn_blocking(move || applier.apply(&manifest.files)).await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("manifest apply task failed: {}", e);
                return CycleOutcome::ApplyAborted;
            }
        };

        let restarted = report.changed() && self.restart_probe().await;

        let logs_forwarded = self
            .forwarder
            .forward(self.runtime.as_ref(), self.controller.as_ref(), &token)
            .await;

        CycleOutcome::Applied(CycleSummary {
            report,
            restarted,
            logs_forwarded,
        })
    }

    async fn acquire_token(&self) -> Option<AccessToken> {
        for host in self.config.host_candidates() {
            match self.controller.request_token(&host).await {
                Ok(token) => return Some(token),
                Err(e) => tracing::warn!(host = %host, "token request failed: {}", e),
            }
        }
        None
    }

    async fn restart_probe(&self) -> bool {
        tracing::info!(
            container = %self.config.probe_container,
            delay_ms = self.config.restart_delay.as_millis() as u64,
            "changes detected, restarting probe"
        );
        tokio::time::sleep(self.config.restart_delay).await;

        match self.runtime.restart(&self.config.probe_container).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(container = %self.config.probe_container, "restart failed: {}", e);
                false
            }
        }
    }
}
