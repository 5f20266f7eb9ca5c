pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "probe")]
#[command(about = "Edge speedtest probe: measurement endpoints plus a self-updating sync agent")]
pub struct Args {
    /// Default log level, RUST_LOG directives take precedence
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long, global = true, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
