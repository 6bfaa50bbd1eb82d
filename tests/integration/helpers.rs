//! Shared fixtures for the integration tests

use std::path::Path;

use watcher_metrics::collectors::ping::{PingCollector, PingSample};
use watcher_metrics::config::CollectorConfig;
use watcher_metrics::rollup::AverageMode;

/// Aligned to every standard tier interval (two hours included)
pub const T0: i64 = 1_700_006_400;

pub fn ping_collector(dir: &Path) -> PingCollector {
    PingCollector::from_config(dir, &CollectorConfig::default(), AverageMode::Unweighted)
}

/// One probe every 30s in `[start, start + count * 30)`, alternating
/// 10ms and 20ms so every minute averages 15ms
pub fn pings(start: i64, count: i64, host: &str) -> Vec<PingSample> {
    (0..count)
        .map(|i| PingSample::success(start + i * 30, host, if i % 2 == 0 { 10.0 } else { 20.0 }))
        .collect()
}

pub fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
