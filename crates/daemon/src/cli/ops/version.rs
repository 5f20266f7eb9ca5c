use clap::Args;

use common::prelude::build_info;

/// Print build information.
#[derive(Args, Debug, Clone)]
pub struct Version {
    /// Emit the same JSON document `GET /version` embeds under `build`
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("failed to encode build info: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = VersionError;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let build = build_info();
        if self.json {
            Ok(serde_json::to_string_pretty(&build)?)
        } else {
            Ok(build.to_string())
        }
    }
}
