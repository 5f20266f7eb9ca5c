use std::sync::Arc;

use clap::Args;

use probe_daemon::controller::{ControllerClient, ControllerError};
use probe_daemon::service_config::DEFAULT_CENTRAL_URL;
use probe_daemon::speedtest::{SpeedtestError, SpeedtestRunner};

/// Run one speed test from this machine and print the sample as JSON.
#[derive(Args, Debug, Clone)]
pub struct Speedtest {
    /// Probe to measure against, e.g. https://probe-1.example
    #[arg(long)]
    pub server_url: String,

    /// Controller that issues the measurement token
    #[arg(long, env = "CENTRAL_URL", default_value = DEFAULT_CENTRAL_URL)]
    pub central_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SpeedtestOpError {
    #[error("controller: {0}")]
    Controller(#[from] ControllerError),
    #[error("speed test failed: {0}")]
    Speedtest(#[from] SpeedtestError),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Speedtest {
    type Error = SpeedtestOpError;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let controller = ControllerClient::new(self.central_url.trim_end_matches('/'))?;
        let runner = SpeedtestRunner::new(Arc::new(controller))?;
        let sample = runner.run(&self.server_url).await?;
        Ok(serde_json::to_string_pretty(&sample)?)
    }
}
