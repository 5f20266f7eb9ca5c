use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use probe_daemon::auth::StaticKeyConfig;
use probe_daemon::docker::DEFAULT_SOCKET_PATH;
use probe_daemon::service_config::{
    DEFAULT_ACME_CONTAINER, DEFAULT_AGENT_CONTAINER, DEFAULT_CENTRAL_URL,
    DEFAULT_GARBAGE_CHUNK_SIZE, DEFAULT_PORT, DEFAULT_PROBE_CONTAINER, DEFAULT_PROXY_CONTAINER,
    DEFAULT_SELF_PATH, DEFAULT_SYNC_INTERVAL_MS,
};
use probe_daemon::{spawn_service, ServiceConfig, ServiceExit, ServiceMode};

use crate::cli::op::OpContext;

/// Settings shared by every long-running mode.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Controller base URL. The server falls back to the public controller,
    /// the sync agent stays idle without it.
    #[arg(long, env = "CENTRAL_URL")]
    pub central_url: Option<String>,

    /// Public domain of this probe
    #[arg(long, env = "DOMAIN", default_value = "")]
    pub domain: String,

    /// Host this probe identifies as to the controller, defaults to the domain
    #[arg(long, env = "SELF_HOST", default_value = "")]
    pub self_host: String,

    #[arg(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_addr: IpAddr,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding landing.html and logo.png
    #[arg(long, env = "STATIC_DIR", default_value = ".")]
    pub static_dir: PathBuf,

    /// Size in bytes of the buffer repeated by /garbage
    #[arg(long, env = "GARBAGE_CHUNK_SIZE", default_value_t = DEFAULT_GARBAGE_CHUNK_SIZE)]
    pub garbage_chunk_size: usize,

    /// Require a controller-issued token on /empty and /garbage
    #[arg(long, env = "PROBE_REQUIRE_AUTH")]
    pub require_auth: bool,

    /// Issuers whose key endpoint may be followed, comma separated
    #[arg(long = "trusted-issuer", env = "PROBE_TRUSTED_ISSUERS", value_delimiter = ',')]
    pub trusted_issuers: Vec<String>,

    /// Verification key as inline PEM
    #[arg(long, env = "PUBLIC_KEY", hide_env_values = true)]
    pub public_key: Option<String>,

    /// Verification key as base64 encoded PEM
    #[arg(long, env = "PUBLIC_KEY_BASE64", hide_env_values = true)]
    pub public_key_b64: Option<String>,

    /// Verification key read from a PEM file
    #[arg(long, env = "PUBLIC_KEY_FILE")]
    pub public_key_file: Option<PathBuf>,

    /// Milliseconds between sync cycles
    #[arg(long, env = "AUTO_UPDATE_INTERVAL_MS", default_value_t = DEFAULT_SYNC_INTERVAL_MS)]
    pub interval_ms: u64,

    #[arg(long, env = "PROBE_CONTAINER", default_value = DEFAULT_PROBE_CONTAINER)]
    pub probe_container: String,

    #[arg(long, env = "AGENT_CONTAINER", default_value = DEFAULT_AGENT_CONTAINER)]
    pub agent_container: String,

    #[arg(long, env = "PROXY_CONTAINER", default_value = DEFAULT_PROXY_CONTAINER)]
    pub proxy_container: String,

    #[arg(long, env = "ACME_CONTAINER", default_value = DEFAULT_ACME_CONTAINER)]
    pub acme_container: String,

    /// Container runtime control socket
    #[arg(long, env = "DOCKER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub docker_socket: PathBuf,

    /// Directory manifest paths are resolved against
    #[arg(long, env = "APPLY_DIR", default_value = ".")]
    pub apply_dir: PathBuf,

    /// Manifest path of this executable, a change to it triggers a restart
    #[arg(long, env = "SELF_PATH", default_value = DEFAULT_SELF_PATH)]
    pub self_path: String,
}

impl ServiceArgs {
    pub fn into_config(self, ctx: &OpContext) -> ServiceConfig {
        let agent_central_url = self
            .central_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or_default();
        let central_url = if agent_central_url.is_empty() {
            DEFAULT_CENTRAL_URL.to_string()
        } else {
            agent_central_url.clone()
        };

        ServiceConfig {
            central_url,
            agent_central_url,
            domain: self.domain,
            self_host: self.self_host,
            listen_addr: SocketAddr::new(self.bind_addr, self.port),
            static_dir: self.static_dir,
            garbage_chunk_size: self.garbage_chunk_size,
            require_auth: self.require_auth,
            trusted_issuers: self
                .trusted_issuers
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect(),
            static_keys: StaticKeyConfig {
                pem: self.public_key,
                pem_base64: self.public_key_b64,
                pem_file: self.public_key_file,
            },
            sync_interval: Duration::from_millis(self.interval_ms),
            probe_container: self.probe_container,
            agent_container: self.agent_container,
            proxy_container: self.proxy_container,
            acme_container: self.acme_container,
            docker_socket: self.docker_socket,
            apply_dir: self.apply_dir,
            self_path: self.self_path,
            log_level: ctx.log_level,
            log_dir: ctx.log_dir.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

async fn run_mode(
    args: &ServiceArgs,
    ctx: &OpContext,
    mode: ServiceMode,
) -> Result<String, ServiceError> {
    if args.interval_ms == 0 {
        return Err(ServiceError::InvalidConfig(
            "sync interval must be positive".to_string(),
        ));
    }
    if args.garbage_chunk_size == 0 {
        return Err(ServiceError::InvalidConfig(
            "garbage chunk size must be positive".to_string(),
        ));
    }

    let config = args.clone().into_config(ctx);
    match spawn_service(&config, mode).await {
        ServiceExit::SelfUpdate => Ok("probe updated, exiting for restart".to_string()),
        ServiceExit::Shutdown => Ok("probe stopped".to_string()),
    }
}

/// Serve the measurement endpoints.
#[derive(Args, Debug, Clone)]
pub struct Serve {
    #[command(flatten)]
    pub service: ServiceArgs,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Serve {
    type Error = ServiceError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        run_mode(&self.service, ctx, ServiceMode::Serve).await
    }
}

/// Run the sync agent only.
#[derive(Args, Debug, Clone)]
pub struct Agent {
    #[command(flatten)]
    pub service: ServiceArgs,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Agent {
    type Error = ServiceError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        run_mode(&self.service, ctx, ServiceMode::Agent).await
    }
}

/// Serve and sync in one process.
#[derive(Args, Debug, Clone)]
pub struct Run {
    #[command(flatten)]
    pub service: ServiceArgs,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Run {
    type Error = ServiceError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        run_mode(&self.service, ctx, ServiceMode::All).await
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        service: ServiceArgs,
    }

    fn parse(args: &[&str]) -> ServiceConfig {
        let ctx = OpContext::new(tracing::Level::INFO, None);
        Cli::try_parse_from(args).unwrap().service.into_config(&ctx)
    }

    #[test]
    fn test_agent_stays_idle_without_controller_url() {
        let config = parse(&["probe", "--domain", "probe-1.example"]);

        assert_eq!(config.central_url, DEFAULT_CENTRAL_URL);
        assert_eq!(config.sync_config().central_url, "");
    }

    #[test]
    fn test_explicit_controller_url_reaches_both_halves() {
        let config = parse(&["probe", "--central-url", "https://central.example/"]);

        assert_eq!(config.central_url, "https://central.example");
        assert_eq!(config.sync_config().central_url, "https://central.example");
    }
}
