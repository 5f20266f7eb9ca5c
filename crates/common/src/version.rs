use serde::Serialize;

/// Compile time information about the running binary.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub build_profile: &'static str,
    pub build_target: &'static str,
    pub build_timestamp: &'static str,
    pub version: &'static str,
    pub crate_version: &'static str,
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "probe {} ({}, {} build for {}, built {})",
            self.crate_version,
            self.version,
            self.build_profile,
            self.build_target,
            self.build_timestamp
        )
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        build_profile: env!("BUILD_PROFILE"),
        build_target: env!("BUILD_TARGET"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        version: env!("REPO_VERSION"),
        crate_version: env!("CARGO_PKG_VERSION"),
    }
}
