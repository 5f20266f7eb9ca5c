use common::prelude::AccessToken;

use crate::controller::{ControllerApi, LogRecord};
use crate::docker::ContainerRuntime;

/// Ships the recent logs of a fixed set of containers to the controller.
#[derive(Debug, Clone)]
pub struct LogForwarder {
    containers: Vec<String>,
}

impl LogForwarder {
    pub fn new(containers: Vec<String>) -> Self {
        let mut unique = Vec::with_capacity(containers.len());
        for name in containers {
            if !name.is_empty() && !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self { containers: unique }
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    /// Harvest and forward each container independently. Returns how many
    /// containers had logs delivered.
    pub async fn forward(
        &self,
        runtime: &dyn ContainerRuntime,
        controller: &dyn ControllerApi,
        token: &AccessToken,
    ) -> usize {
        let mut delivered = 0;

        for container in &self.containers {
            let logs = match runtime.logs(container).await {
                Ok(logs) => logs,
                Err(e) => {
                    tracing::warn!(container = %container, "failed to read container logs: {}", e);
                    continue;
                }
            };
            if logs.is_empty() {
                continue;
            }

            let record = LogRecord::container_logs(container, logs);
            match controller.send_log(token, &record).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(container = %container, "failed to forward container logs: {}", e)
                }
            }
        }

        delivered
    }
}
