// Measurement engine and its auth gate
pub mod auth;
pub mod http_server;
pub mod speedtest;

// Sync agent and the outside systems it talks to
pub mod controller;
pub mod docker;
pub mod sync;

// Process wiring
pub mod process;
pub mod service_config;
pub mod service_state;

pub use process::{spawn_service, start_service, ServiceExit, ServiceMode, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
pub use service_state::State as ServiceState;
