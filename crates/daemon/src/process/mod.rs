pub mod utils;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::controller::ControllerClient;
use crate::docker::ControlSocketClient;
use crate::http_server;
use crate::sync::{LoopExit, SyncAgent};
use crate::{ServiceConfig, ServiceState};

/// Which halves of the probe run in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// Measurement endpoints only
    Serve,
    /// Sync agent only
    Agent,
    /// Both, sharing one process
    All,
}

impl ServiceMode {
    fn serves(self) -> bool {
        matches!(self, ServiceMode::Serve | ServiceMode::All)
    }

    fn syncs(self) -> bool {
        matches!(self, ServiceMode::Agent | ServiceMode::All)
    }
}

/// Why the probe stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    /// Signal or explicit shutdown
    Shutdown,
    /// The agent replaced its own executable; the supervisor should start
    /// the new one.
    SelfUpdate,
}

/// Handle for gracefully shutting down the probe.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    self_updated: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal, explicit shutdown or
    /// self-update).
    pub async fn wait(self) -> ServiceExit {
        shutdown_and_join(self.graceful_waiter, self.handles).await;
        if self.self_updated.load(Ordering::SeqCst) {
            ServiceExit::SelfUpdate
        } else {
            ServiceExit::Shutdown
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
pub fn init_logging(
    log_level: tracing::Level,
    log_dir: Option<&PathBuf>,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "probe.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Create service state from config, exiting on error.
fn create_state(service_config: &ServiceConfig) -> ServiceState {
    match ServiceState::from_config(service_config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("error creating server state: {}", e);
            std::process::exit(3);
        }
    }
}

/// Wait for shutdown and join all handles with timeout.
async fn shutdown_and_join(
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
) {
    let _ = graceful_waiter.await;

    if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(handles))
        .await
        .is_err()
    {
        tracing::error!(
            "Failed to shut down within {} seconds",
            FINAL_SHUTDOWN_TIMEOUT.as_secs()
        );
        std::process::exit(4);
    }
}

/// Create state and spawn the requested tasks.
///
/// The returned `ShutdownHandle` must be kept alive; dropping it does not
/// stop the service.
pub async fn start_service(
    service_config: &ServiceConfig,
    mode: ServiceMode,
) -> (ServiceState, ShutdownHandle) {
    let (graceful_waiter, shutdown_tx, shutdown_rx) = match utils::graceful_shutdown_blocker() {
        Ok(blocker) => blocker,
        Err(e) => {
            tracing::error!("failed to install signal handlers: {}", e);
            std::process::exit(2);
        }
    };
    let state = create_state(service_config);

    let mut handles = Vec::new();
    let self_updated = Arc::new(AtomicBool::new(false));

    if mode.serves() {
        let api_config = http_server::Config::new(service_config.listen_addr)
            .with_log_level(service_config.log_level);
        let api_state = state.clone();
        let api_rx = shutdown_rx.clone();
        let api_handle = tokio::spawn(async move {
            if let Err(e) = http_server::run(api_config, api_state, api_rx).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
        handles.push(api_handle);
    }

    if mode.syncs() {
        let sync_config = service_config.sync_config();
        if sync_config.self_host.is_empty() || sync_config.central_url.is_empty() {
            tracing::warn!("CENTRAL_URL and SELF_HOST (or DOMAIN) are required, sync cycles will be skipped");
        }

        let controller = match ControllerClient::new(&sync_config.central_url) {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                tracing::error!("error creating controller client: {}", e);
                std::process::exit(3);
            }
        };
        let runtime = Arc::new(ControlSocketClient::new(&service_config.docker_socket));
        let agent = Arc::new(SyncAgent::new(sync_config, controller, runtime));
        let agent_rx = shutdown_rx.clone();
        let agent_tx = shutdown_tx.clone();
        let agent_updated = self_updated.clone();
        let agent_handle = tokio::spawn(async move {
            if agent.run(agent_rx).await == LoopExit::SelfUpdate {
                agent_updated.store(true, Ordering::SeqCst);
                let _ = agent_tx.send(());
            }
        });
        handles.push(agent_handle);
    }

    tracing::info!(
        ?mode,
        addr = %service_config.listen_addr,
        central_url = %service_config.central_url,
        "probe running"
    );

    let handle = ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
        self_updated,
    };

    (state, handle)
}

/// Runs the probe in the requested mode, blocking until a shutdown signal
/// is received or the agent updated itself. Use for CLI binary usage.
///
/// Log writers are flushed before this returns, so the caller may exit
/// right away.
pub async fn spawn_service(service_config: &ServiceConfig, mode: ServiceMode) -> ServiceExit {
    let guards = init_logging(service_config.log_level, service_config.log_dir.as_ref());
    let (_, handle) = start_service(service_config, mode).await;
    let exit = handle.wait().await;
    tracing::info!(?exit, "probe stopped");
    drop(guards);
    exit
}
