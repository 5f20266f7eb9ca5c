pub mod service;
pub mod speedtest;
pub mod version;

pub use service::{Agent, Run, Serve};
pub use speedtest::Speedtest;
pub use version::Version;
