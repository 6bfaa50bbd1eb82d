//! Aggregation primitives shared by every metric family
//!
//! Raw readings are scalars; rollup entries carry `{avg, min, max,
//! samples}` objects. Both shapes feed the same accumulator so a tier can
//! be built from raw data or from the next finer tier.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::Timestamped;

/// Numeric reading type stored in entries (`i64` for mA, `f64` for volts)
pub trait Reading: Copy + PartialOrd + Serialize + DeserializeOwned {
    fn to_f64(self) -> f64;

    /// Convert an averaged value back to the stored representation
    fn from_mean(mean: f64) -> Self;
}

impl Reading for i64 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_mean(mean: f64) -> Self {
        mean.round() as i64
    }
}

impl Reading for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_mean(mean: f64) -> Self {
        mean
    }
}

fn one_sample() -> u64 {
    1
}

/// Aggregated statistics for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats<N> {
    pub avg: N,
    pub min: N,
    pub max: N,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak: Option<N>,
    #[serde(default = "one_sample")]
    pub samples: u64,
}

/// A reading as it appears in a file: bare scalar or aggregate object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue<N> {
    Scalar(N),
    Aggregate(AggregateStats<N>),
}

impl<N: Reading> SampleValue<N> {
    /// Average for aggregates, the value itself for scalars
    pub fn mean(&self) -> N {
        match self {
            SampleValue::Scalar(v) => *v,
            SampleValue::Aggregate(stats) => stats.avg,
        }
    }
}

/// How bucket averages combine rollup entries of a finer tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AverageMode {
    /// Every input entry counts once, whatever its sample count
    #[default]
    Unweighted,
    /// Each input average is weighted by its `samples`
    SampleWeighted,
}

/// Running min/max/mean over scalars and pre-aggregated inputs
#[derive(Debug, Clone)]
pub struct SampleAccumulator<N> {
    means: Vec<(f64, u64)>,
    min: Option<N>,
    max: Option<N>,
    samples: u64,
}

impl<N> Default for SampleAccumulator<N> {
    fn default() -> Self {
        Self {
            means: Vec::new(),
            min: None,
            max: None,
            samples: 0,
        }
    }
}

impl<N: Reading> SampleAccumulator<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: &SampleValue<N>) {
        match value {
            SampleValue::Scalar(v) => self.push_scalar(*v),
            SampleValue::Aggregate(stats) => {
                self.push_stats(stats.avg, stats.min, stats.max, stats.samples)
            }
        }
    }

    pub fn push_scalar(&mut self, value: N) {
        self.push_stats(value, value, value, 1);
    }

    pub fn push_stats(&mut self, avg: N, min: N, max: N, samples: u64) {
        self.push_mean(avg, max, samples);
        if self.min.is_none_or(|m| min < m) {
            self.min = Some(min);
        }
    }

    /// Feed an average and a maximum without a minimum (jitter rollups)
    pub fn push_mean(&mut self, avg: N, max: N, samples: u64) {
        let avg_f = avg.to_f64();
        if avg_f.is_nan() {
            return;
        }
        self.means.push((avg_f, samples.max(1)));
        self.samples += samples.max(1);
        if self.max.is_none_or(|m| max > m) {
            self.max = Some(max);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Number of underlying samples
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn min(&self) -> Option<N> {
        self.min
    }

    pub fn max(&self) -> Option<N> {
        self.max
    }

    pub fn mean(&self, mode: AverageMode) -> Option<f64> {
        if self.means.is_empty() {
            return None;
        }
        let (sum, weight) = match mode {
            AverageMode::Unweighted => (
                self.means.iter().map(|(v, _)| v).sum::<f64>(),
                self.means.len() as f64,
            ),
            AverageMode::SampleWeighted => (
                self.means.iter().map(|(v, w)| v * *w as f64).sum::<f64>(),
                self.means.iter().map(|(_, w)| *w as f64).sum::<f64>(),
            ),
        };
        Some(sum / weight)
    }

    /// Bucket statistics, `None` when nothing was pushed
    pub fn finish(&self, mode: AverageMode) -> Option<AggregateStats<N>> {
        let mean = self.mean(mode)?;
        let min = self.min?;
        let max = self.max?;
        Some(AggregateStats {
            avg: N::from_mean(mean),
            min,
            max,
            peak: None,
            samples: self.samples,
        })
    }
}

/// Turns the entries of one closed bucket into rollup entries
pub trait Aggregator {
    /// Anything found in the source file: raw entries or finer rollups
    type Record: DeserializeOwned + Timestamped;
    /// Entry written to the tier's rollup file
    type Rollup: Serialize + DeserializeOwned + Timestamped;

    /// Aggregate `bucket` (non-empty, all inside `[start, start + interval)`).
    ///
    /// An empty result means the bucket yields nothing and is left
    /// unprocessed.
    fn aggregate(&self, bucket: &[Self::Record], start: i64, interval: i64) -> Vec<Self::Rollup>;
}
