pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Agent, Run, Serve, Speedtest, Version};
