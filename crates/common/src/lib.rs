/**
 * Decoder for the container runtime's multiplexed
 *  log stream (8 byte header + payload frames).
 */
pub mod log_frame;
/**
 * Controller manifest wire model, plus the
 *  rules for classifying manifest paths before
 *  they are applied to disk.
 */
pub mod manifest;
/**
 * Latency, jitter and throughput arithmetic
 *  shared by the test driver and its consumers.
 */
pub mod measurement;
/**
 * Signature-less inspection of token payloads.
 *  Only ever used for hints, never for trust.
 */
pub mod token;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::log_frame::{decode_frames, decode_text, LogFrame, StreamKind};
    pub use crate::manifest::{EntryKind, ManifestEntry, ManifestFile, ManifestResponse};
    pub use crate::measurement::{LatencySummary, MeasurementSample};
    pub use crate::token::{AccessToken, UnverifiedClaims};
    pub use crate::version::{build_info, BuildInfo};
}
