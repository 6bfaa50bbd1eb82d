//! Connectivity ping metrics

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use super::{CollectorPaths, MetricFamily, MetricsCollector};
use crate::config::CollectorConfig;
use crate::rollup::{Aggregator, AverageMode, RollupData, SampleAccumulator, TierTable};
use crate::storage::{StorageResult, Timestamped};
use crate::util::round_to;

pub const NAME: &str = "ping";

const DEFAULT_RAW_RETENTION_HOURS: i64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingStatus {
    Success,
    Failure,
}

/// One probe as written by the connectivity check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSample {
    pub timestamp: i64,
    #[serde(default)]
    pub host: String,
    pub latency: Option<f64>,
    pub status: PingStatus,
}

impl PingSample {
    pub fn success(timestamp: i64, host: &str, latency: f64) -> Self {
        Self {
            timestamp,
            host: host.to_string(),
            latency: Some(latency),
            status: PingStatus::Success,
        }
    }

    pub fn failure(timestamp: i64, host: &str) -> Self {
        Self {
            timestamp,
            host: host.to_string(),
            latency: None,
            status: PingStatus::Failure,
        }
    }
}

impl Timestamped for PingSample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Bucket summary over all probed hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRollup {
    pub timestamp: i64,
    pub period_start: i64,
    pub period_end: i64,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub avg_latency: Option<f64>,
    pub sample_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// Samples that carried a latency
    #[serde(default)]
    pub latency_samples: u64,
    /// Samples per probed host
    #[serde(default, deserialize_with = "host_counts")]
    pub hosts: BTreeMap<String, u64>,
}

impl Timestamped for PingRollup {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

// older writers emitted an empty JSON array when no host was seen
fn host_counts<'de, D>(deserializer: D) -> Result<BTreeMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Map(BTreeMap<String, u64>),
        List(Vec<serde_json::Value>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Map(map) => map,
        Repr::List(_) => BTreeMap::new(),
    })
}

/// Anything a ping tier can read: raw probes or finer rollups
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PingRecord {
    Rollup(PingRollup),
    Sample(PingSample),
}

impl Timestamped for PingRecord {
    fn timestamp(&self) -> i64 {
        match self {
            PingRecord::Rollup(r) => r.timestamp,
            PingRecord::Sample(s) => s.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingAggregator {
    pub mode: AverageMode,
}

impl Aggregator for PingAggregator {
    type Record = PingRecord;
    type Rollup = PingRollup;

    fn aggregate(&self, bucket: &[PingRecord], start: i64, interval: i64) -> Vec<PingRollup> {
        let mut latency = SampleAccumulator::<f64>::new();
        let mut sample_count = 0;
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut hosts: BTreeMap<String, u64> = BTreeMap::new();

        for record in bucket {
            match record {
                PingRecord::Sample(sample) => {
                    sample_count += 1;
                    match sample.status {
                        PingStatus::Success => success_count += 1,
                        PingStatus::Failure => failure_count += 1,
                    }
                    if let Some(l) = sample.latency {
                        latency.push_scalar(l);
                    }
                    if !sample.host.is_empty() {
                        *hosts.entry(sample.host.clone()).or_default() += 1;
                    }
                }
                PingRecord::Rollup(rollup) => {
                    sample_count += rollup.sample_count;
                    success_count += rollup.success_count;
                    failure_count += if rollup.failure_count == 0 {
                        rollup.sample_count.saturating_sub(rollup.success_count)
                    } else {
                        rollup.failure_count
                    };
                    if let (Some(avg), Some(min), Some(max)) =
                        (rollup.avg_latency, rollup.min_latency, rollup.max_latency)
                    {
                        let weight = match rollup.latency_samples {
                            0 => rollup.success_count,
                            n => n,
                        };
                        latency.push_stats(avg, min, max, weight);
                    }
                    for (host, count) in &rollup.hosts {
                        *hosts.entry(host.clone()).or_default() += count;
                    }
                }
            }
        }

        if sample_count == 0 {
            return vec![];
        }

        vec![PingRollup {
            timestamp: start,
            period_start: start,
            period_end: start + interval,
            min_latency: latency.min().map(|v| round_to(v, 3)),
            max_latency: latency.max().map(|v| round_to(v, 3)),
            avg_latency: latency.mean(self.mode).map(|v| round_to(v, 3)),
            sample_count,
            success_count,
            failure_count,
            latency_samples: latency.samples(),
            hosts,
        }]
    }
}

impl MetricFamily for PingAggregator {
    type Raw = PingSample;
}

pub type PingCollector = MetricsCollector<PingAggregator>;

impl PingCollector {
    pub fn from_config(data_dir: &Path, config: &CollectorConfig, mode: AverageMode) -> Self {
        let paths =
            CollectorPaths::in_dir(data_dir.join(NAME)).with_raw_file(config.raw_file.clone());
        MetricsCollector::new(
            NAME,
            paths,
            TierTable::standard(),
            config.raw_retention_secs_or(DEFAULT_RAW_RETENTION_HOURS),
            PingAggregator { mode },
        )
    }

    /// Rollups of the last `hours`, optionally only buckets that probed `host`
    pub fn host_metrics_at(
        &self,
        hours: i64,
        host: Option<&str>,
        now: i64,
    ) -> StorageResult<RollupData<PingRollup>> {
        self.get_metrics_at(
            hours,
            |r: &PingRollup| host.is_none_or(|h| r.hosts.contains_key(h)),
            now,
        )
    }
}
