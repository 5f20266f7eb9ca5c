use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::StaticKeyConfig;
use crate::docker::DEFAULT_SOCKET_PATH;
use crate::sync::{resolve_self_host, SyncConfig, RESTART_DEBOUNCE};

pub const DEFAULT_CENTRAL_URL: &str = "https://speedtest.net.ar";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_PROBE_CONTAINER: &str = "speedtest-probe";
pub const DEFAULT_AGENT_CONTAINER: &str = "speedtest-autoupdate";
pub const DEFAULT_PROXY_CONTAINER: &str = "nginx-proxy";
pub const DEFAULT_ACME_CONTAINER: &str = "speedtest-acme";
pub const DEFAULT_SELF_PATH: &str = "bin/probe";
pub const DEFAULT_GARBAGE_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    // controller
    /// Controller base URL, without a trailing slash
    pub central_url: String,
    /// Controller the sync agent talks to. Only set when configured
    /// explicitly; empty keeps every cycle from running.
    pub agent_central_url: String,
    /// Declared domain of this probe, may be empty
    pub domain: String,
    /// Explicit self host, falls back to the domain
    pub self_host: String,

    // http server configuration
    pub listen_addr: SocketAddr,
    /// Directory holding `landing.html` and `logo.png`
    pub static_dir: PathBuf,
    /// Size of the reusable buffer streamed by `/garbage`
    pub garbage_chunk_size: usize,
    /// Gate the measurement routes behind token verification
    pub require_auth: bool,

    // auth
    pub trusted_issuers: Vec<String>,
    pub static_keys: StaticKeyConfig,

    // agent
    pub sync_interval: Duration,
    pub probe_container: String,
    pub agent_container: String,
    pub proxy_container: String,
    pub acme_container: String,
    pub docker_socket: PathBuf,
    /// Root that manifest paths are relative to
    pub apply_dir: PathBuf,
    /// Manifest path of the agent's own executable
    pub self_path: String,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            central_url: DEFAULT_CENTRAL_URL.to_string(),
            agent_central_url: String::new(),
            domain: String::new(),
            self_host: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            static_dir: PathBuf::from("."),
            garbage_chunk_size: DEFAULT_GARBAGE_CHUNK_SIZE,
            require_auth: false,
            trusted_issuers: Vec::new(),
            static_keys: StaticKeyConfig::default(),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            probe_container: DEFAULT_PROBE_CONTAINER.to_string(),
            agent_container: DEFAULT_AGENT_CONTAINER.to_string(),
            proxy_container: DEFAULT_PROXY_CONTAINER.to_string(),
            acme_container: DEFAULT_ACME_CONTAINER.to_string(),
            docker_socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            apply_dir: PathBuf::from("."),
            self_path: DEFAULT_SELF_PATH.to_string(),
            log_level: tracing::Level::INFO,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn resolved_self_host(&self) -> String {
        resolve_self_host(&self.self_host, &self.domain)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            central_url: self.agent_central_url.clone(),
            self_host: self.resolved_self_host(),
            domain: self.domain.trim().to_string(),
            interval: self.sync_interval,
            restart_delay: RESTART_DEBOUNCE,
            probe_container: self.probe_container.clone(),
            log_containers: vec![
                self.probe_container.clone(),
                self.agent_container.clone(),
                self.proxy_container.clone(),
                self.acme_container.clone(),
            ],
            apply_dir: self.apply_dir.clone(),
            self_path: self.self_path.clone(),
        }
    }
}
