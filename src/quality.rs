//! Network quality ratings and jitter estimation

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::round_to;

/// Four-step quality ladder, ordered best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityRating {
    Good,
    Fair,
    Poor,
    Critical,
}

impl fmt::Display for QualityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityRating::Good => "good",
            QualityRating::Fair => "fair",
            QualityRating::Poor => "poor",
            QualityRating::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// Upper bounds (exclusive) for good, fair and poor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub good: f64,
    pub fair: f64,
    pub poor: f64,
}

impl Thresholds {
    pub const fn new(good: f64, fair: f64, poor: f64) -> Self {
        Self { good, fair, poor }
    }

    pub fn rate(&self, value: f64) -> QualityRating {
        quality_rating(value, self.good, self.fair, self.poor)
    }
}

/// Latency in ms
pub const LATENCY_THRESHOLDS: Thresholds = Thresholds::new(50.0, 100.0, 250.0);
/// Jitter in ms
pub const JITTER_THRESHOLDS: Thresholds = Thresholds::new(10.0, 20.0, 50.0);
/// Packet loss in percent
pub const PACKET_LOSS_THRESHOLDS: Thresholds = Thresholds::new(1.0, 2.0, 5.0);

pub fn quality_rating(value: f64, good: f64, fair: f64, poor: f64) -> QualityRating {
    if value < good {
        QualityRating::Good
    } else if value < fair {
        QualityRating::Fair
    } else if value < poor {
        QualityRating::Poor
    } else {
        QualityRating::Critical
    }
}

/// Worst rating present, `Good` when there is none
pub fn overall_quality<I>(ratings: I) -> QualityRating
where
    I: IntoIterator<Item = QualityRating>,
{
    ratings.into_iter().max().unwrap_or(QualityRating::Good)
}

/// Jitter estimator state for one host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostJitter {
    pub prev_latency: f64,
    /// Unrounded running estimate
    pub jitter: f64,
}

/// RFC 3550 interarrival jitter, tracked per host.
///
/// The state is owned by the caller and only lives as long as the
/// caller keeps it; nothing is persisted.
#[derive(Debug, Clone, Default)]
pub struct JitterState {
    hosts: HashMap<String, HostJitter>,
}

impl JitterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one latency sample for `host`.
    ///
    /// Returns `None` for the first sample of a host, otherwise the
    /// updated estimate `J += (|D| - J) / 16` rounded to 2 decimals.
    pub fn observe(&mut self, host: &str, latency: f64) -> Option<f64> {
        match self.hosts.get_mut(host) {
            None => {
                self.hosts.insert(
                    host.to_string(),
                    HostJitter {
                        prev_latency: latency,
                        jitter: 0.0,
                    },
                );
                None
            }
            Some(state) => {
                let d = (latency - state.prev_latency).abs();
                state.jitter += (d - state.jitter) / 16.0;
                state.prev_latency = latency;
                Some(round_to(state.jitter, 2))
            }
        }
    }

    pub fn get(&self, host: &str) -> Option<&HostJitter> {
        self.hosts.get(host)
    }

    /// Forget one host, e.g. after it went offline
    pub fn forget(&mut self, host: &str) {
        self.hosts.remove(host);
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Average and peak jitter over a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JitterSummary {
    pub avg: f64,
    pub max: f64,
}

/// Jitter over an ordered latency series, run through a fresh
/// estimator. `None` with fewer than two samples.
pub fn jitter_from_latencies(latencies: &[f64]) -> Option<JitterSummary> {
    if latencies.len() < 2 {
        return None;
    }

    let mut jitter = 0.0f64;
    let mut sum = 0.0;
    let mut max = 0.0f64;
    for pair in latencies.windows(2) {
        let d = (pair[1] - pair[0]).abs();
        jitter += (d - jitter) / 16.0;
        sum += jitter;
        max = max.max(jitter);
    }

    let steps = (latencies.len() - 1) as f64;
    Some(JitterSummary {
        avg: round_to(sum / steps, 2),
        max: round_to(max, 2),
    })
}

/// Min, max, mean and optional 95th percentile of a latency series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
}

/// Summarise `latencies`, rounding to `precision` decimals.
///
/// The percentile is taken from the sorted series at index
/// `ceil(n * 0.95) - 1`.
pub fn aggregate_latencies(
    latencies: &[f64],
    precision: u32,
    include_p95: bool,
) -> Option<LatencySummary> {
    let mut values: Vec<f64> = latencies.iter().copied().filter(|v| !v.is_nan()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    let avg = values.iter().sum::<f64>() / n as f64;
    let p95 = include_p95.then(|| {
        let idx = ((n as f64 * 0.95).ceil() as usize).saturating_sub(1);
        round_to(values[idx.min(n - 1)], precision)
    });

    Some(LatencySummary {
        min: round_to(values[0], precision),
        max: round_to(values[n - 1], precision),
        avg: round_to(avg, precision),
        p95,
    })
}
