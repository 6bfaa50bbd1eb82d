//! Latency and jitter towards multi-sync remote players
//!
//! One raw entry per remote per check; rollups hold one entry per host
//! and bucket.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ping::PingStatus;
use super::{CollectorPaths, MetricFamily, MetricsCollector};
use crate::config::CollectorConfig;
use crate::quality::JitterState;
use crate::rollup::{Aggregator, AverageMode, RollupData, SampleAccumulator, TierTable};
use crate::storage::{StorageResult, Timestamped};
use crate::util::round_to;

pub const NAME: &str = "multisync_ping";

const DEFAULT_RAW_RETENTION_HOURS: i64 = 25;

/// Outcome of pinging one remote, as handed over by the prober
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePing {
    pub hostname: String,
    pub address: String,
    pub latency: Option<f64>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSyncPingSample {
    pub timestamp: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub address: String,
    pub latency: Option<f64>,
    #[serde(default)]
    pub jitter: Option<f64>,
    pub status: PingStatus,
}

impl Timestamped for MultiSyncPingSample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSyncPingRollup {
    pub timestamp: i64,
    pub period_start: i64,
    pub period_end: i64,
    pub hostname: String,
    #[serde(default)]
    pub address: String,
    pub sample_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// Samples that carried a latency
    #[serde(default)]
    pub latency_samples: u64,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub avg_latency: Option<f64>,
    pub avg_jitter: Option<f64>,
    pub max_jitter: Option<f64>,
}

impl Timestamped for MultiSyncPingRollup {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MultiSyncPingRecord {
    Rollup(MultiSyncPingRollup),
    Sample(MultiSyncPingSample),
}

impl Timestamped for MultiSyncPingRecord {
    fn timestamp(&self) -> i64 {
        match self {
            MultiSyncPingRecord::Rollup(r) => r.timestamp,
            MultiSyncPingRecord::Sample(s) => s.timestamp,
        }
    }
}

#[derive(Debug, Default)]
struct HostBucket {
    address: String,
    latency: SampleAccumulator<f64>,
    jitter: SampleAccumulator<f64>,
    success_count: u64,
    failure_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MultiSyncPingAggregator {
    pub mode: AverageMode,
}

impl Aggregator for MultiSyncPingAggregator {
    type Record = MultiSyncPingRecord;
    type Rollup = MultiSyncPingRollup;

    fn aggregate(
        &self,
        bucket: &[MultiSyncPingRecord],
        start: i64,
        interval: i64,
    ) -> Vec<MultiSyncPingRollup> {
        let mut hosts: BTreeMap<String, HostBucket> = BTreeMap::new();

        for record in bucket {
            match record {
                MultiSyncPingRecord::Sample(s) => {
                    let host = host_bucket(&mut hosts, &s.hostname, &s.address);
                    if let Some(latency) = s.latency {
                        host.latency.push_scalar(latency);
                    }
                    if let Some(jitter) = s.jitter {
                        host.jitter.push_scalar(jitter);
                    }
                    match s.status {
                        PingStatus::Success => host.success_count += 1,
                        PingStatus::Failure => host.failure_count += 1,
                    }
                }
                MultiSyncPingRecord::Rollup(r) => {
                    let host = host_bucket(&mut hosts, &r.hostname, &r.address);
                    let weight = match r.latency_samples {
                        0 => r.success_count,
                        n => n,
                    };
                    if let (Some(avg), Some(min), Some(max)) =
                        (r.avg_latency, r.min_latency, r.max_latency)
                    {
                        host.latency.push_stats(avg, min, max, weight);
                    }
                    if let Some(avg) = r.avg_jitter {
                        host.jitter
                            .push_mean(avg, r.max_jitter.unwrap_or(avg), weight);
                    }
                    host.success_count += r.success_count;
                    host.failure_count += r.failure_count;
                }
            }
        }

        hosts
            .into_iter()
            .map(|(hostname, host)| MultiSyncPingRollup {
                timestamp: start,
                period_start: start,
                period_end: start + interval,
                hostname,
                address: host.address,
                sample_count: host.success_count + host.failure_count,
                success_count: host.success_count,
                failure_count: host.failure_count,
                latency_samples: host.latency.samples(),
                min_latency: host.latency.min().map(|v| round_to(v, 3)),
                max_latency: host.latency.max().map(|v| round_to(v, 3)),
                avg_latency: host.latency.mean(self.mode).map(|v| round_to(v, 3)),
                avg_jitter: host.jitter.mean(self.mode).map(|v| round_to(v, 2)),
                max_jitter: host.jitter.max().map(|v| round_to(v, 2)),
            })
            .collect()
    }
}

fn host_bucket<'a>(
    hosts: &'a mut BTreeMap<String, HostBucket>,
    hostname: &str,
    address: &str,
) -> &'a mut HostBucket {
    let name = if hostname.is_empty() { "unknown" } else { hostname };
    let host = hosts.entry(name.to_string()).or_default();
    if host.address.is_empty() {
        host.address = address.to_string();
    }
    host
}

impl MetricFamily for MultiSyncPingAggregator {
    type Raw = MultiSyncPingSample;

    fn dimension(rollup: &MultiSyncPingRollup) -> Option<&str> {
        Some(&rollup.hostname)
    }
}

pub type MultiSyncPingCollector = MetricsCollector<MultiSyncPingAggregator>;

impl MultiSyncPingCollector {
    pub fn from_config(data_dir: &Path, config: &CollectorConfig, mode: AverageMode) -> Self {
        let paths =
            CollectorPaths::in_dir(data_dir.join(NAME)).with_raw_file(config.raw_file.clone());
        MetricsCollector::new(
            NAME,
            paths,
            TierTable::standard(),
            config.raw_retention_secs_or(DEFAULT_RAW_RETENTION_HOURS),
            MultiSyncPingAggregator { mode },
        )
    }

    /// Turn one round of remote pings into raw entries and append them.
    ///
    /// Remotes without an address are skipped. Jitter is derived from
    /// successful latencies through the caller's `jitter` state.
    pub fn record_pings_at(
        &self,
        pings: &[RemotePing],
        jitter: &mut JitterState,
        now: i64,
    ) -> StorageResult<Vec<MultiSyncPingSample>> {
        let samples: Vec<MultiSyncPingSample> = pings
            .iter()
            .filter(|p| !p.address.is_empty())
            .map(|p| {
                let host_jitter = match p.latency {
                    Some(latency) if p.success => jitter.observe(&p.hostname, latency),
                    _ => None,
                };
                MultiSyncPingSample {
                    timestamp: now,
                    hostname: p.hostname.clone(),
                    address: p.address.clone(),
                    latency: p.latency,
                    jitter: host_jitter,
                    status: if p.success {
                        PingStatus::Success
                    } else {
                        PingStatus::Failure
                    },
                }
            })
            .collect();

        debug!("recording {} multi-sync pings", samples.len());
        self.write_raw(&samples)?;
        Ok(samples)
    }

    pub fn record_pings(
        &self,
        pings: &[RemotePing],
        jitter: &mut JitterState,
    ) -> StorageResult<Vec<MultiSyncPingSample>> {
        self.record_pings_at(pings, jitter, crate::util::unix_now())
    }

    /// Rollups of the last `hours`, optionally for one host only
    pub fn host_metrics_at(
        &self,
        hours: i64,
        hostname: Option<&str>,
        now: i64,
    ) -> StorageResult<RollupData<MultiSyncPingRollup>> {
        self.get_metrics_at(
            hours,
            |r: &MultiSyncPingRollup| hostname.is_none_or(|h| r.hostname == h),
            now,
        )
    }

    /// Raw samples of the last `hours`, optionally for one host only
    pub fn raw_metrics_at(
        &self,
        hours: i64,
        hostname: Option<&str>,
        now: i64,
    ) -> StorageResult<Vec<MultiSyncPingSample>> {
        self.read_raw_window_at(
            hours,
            |s: &MultiSyncPingSample| hostname.is_none_or(|h| s.hostname == h),
            now,
        )
    }
}
