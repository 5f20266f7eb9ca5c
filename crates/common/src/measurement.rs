use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of one test-driver run. Latencies in milliseconds, throughput in
/// megabits per second, all rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub ping: f64,
    pub jitter: f64,
    pub download: f64,
    pub upload: f64,
}

/// Ping and jitter derived from a series of round trips.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    /// Arithmetic mean of the samples
    pub ping: f64,
    /// Spread between the slowest and fastest sample
    pub jitter: f64,
}

impl LatencySummary {
    pub fn from_samples(samples_ms: &[f64]) -> Self {
        if samples_ms.is_empty() {
            return Self::default();
        }

        let sum: f64 = samples_ms.iter().sum();
        let max = samples_ms.iter().copied().fold(f64::MIN, f64::max);
        let min = samples_ms.iter().copied().fold(f64::MAX, f64::min);

        Self {
            ping: round2(sum / samples_ms.len() as f64),
            jitter: round2(max - min),
        }
    }
}

/// Megabits per second for `bytes` moved in `elapsed`, rounded to two
/// decimals. A zero duration yields zero rather than infinity.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    round2((bytes as f64 * 8.0) / secs / 1_000_000.0)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
