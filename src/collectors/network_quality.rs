//! Network quality towards multi-sync remotes
//!
//! Raw samples carry the HTTP response time of a remote and the sync
//! packet counters of player and remote. Rollups summarise latency,
//! jitter and estimated packet loss per host, each with a quality
//! rating.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use super::{CollectorPaths, MetricFamily, MetricsCollector};
use crate::config::CollectorConfig;
use crate::quality::{
    JITTER_THRESHOLDS, JitterState, LATENCY_THRESHOLDS, PACKET_LOSS_THRESHOLDS, QualityRating,
    aggregate_latencies, jitter_from_latencies, overall_quality,
};
use crate::rollup::{Aggregator, AverageMode, RollupData, SampleAccumulator, TierTable};
use crate::storage::{StorageResult, Timestamped};
use crate::util::round_to;

pub const NAME: &str = "network_quality";

const DEFAULT_RAW_RETENTION_HOURS: i64 = 25;

/// Sync packets per second assumed without a known step time (20fps)
const DEFAULT_SYNC_RATE: f64 = 2.0;

/// Expected sync packet rate for a sequence step time in ms.
///
/// The player sends one sync packet every 10 frames.
pub fn expected_sync_rate(step_time_ms: Option<u64>) -> f64 {
    match step_time_ms {
        Some(ms) if ms > 0 => (1000.0 / ms as f64) / 10.0,
        _ => DEFAULT_SYNC_RATE,
    }
}

/// Player side of one collection round
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlayerSnapshot {
    pub packets_sent: u64,
    pub is_playing: bool,
    pub step_time: Option<u64>,
}

/// One remote as seen by one collection round
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObservation {
    pub hostname: String,
    pub address: String,
    pub online: bool,
    /// HTTP response time in ms
    pub response_time: Option<f64>,
    pub packets_received: Option<u64>,
    pub plugin_installed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkQualitySample {
    pub timestamp: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub address: String,
    pub latency: Option<f64>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub player_packets_sent: u64,
    #[serde(default)]
    pub remote_packets_received: Option<u64>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub step_time: Option<u64>,
    #[serde(default)]
    pub plugin_installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_quality: Option<QualityRating>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_quality: Option<QualityRating>,
}

impl Timestamped for NetworkQualitySample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Per-host bucket summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkQualityRollup {
    pub timestamp: i64,
    pub period_start: i64,
    pub period_end: i64,
    pub hostname: String,
    #[serde(default)]
    pub address: String,
    pub sample_count: u64,
    /// Samples that carried a latency
    #[serde(default)]
    pub latency_samples: u64,
    pub latency_min: Option<f64>,
    pub latency_max: Option<f64>,
    pub latency_avg: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_quality: Option<QualityRating>,
    pub jitter_avg: Option<f64>,
    pub jitter_max: Option<f64>,
    pub jitter_quality: Option<QualityRating>,
    pub packet_loss_pct: Option<f64>,
    pub packet_loss_quality: Option<QualityRating>,
    /// Remote sync packets received per second while playing
    pub receive_rate: Option<f64>,
    pub overall_quality: QualityRating,
}

impl Timestamped for NetworkQualityRollup {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NetworkQualityRecord {
    Rollup(NetworkQualityRollup),
    Sample(NetworkQualitySample),
}

impl Timestamped for NetworkQualityRecord {
    fn timestamp(&self) -> i64 {
        match self {
            NetworkQualityRecord::Rollup(r) => r.timestamp,
            NetworkQualityRecord::Sample(s) => s.timestamp,
        }
    }
}

/// Packet counter progress while the player was playing
#[derive(Debug, Default)]
struct PlayingWindow {
    first: Option<(i64, u64)>,
    last: Option<(i64, u64)>,
    samples: u64,
    step_times: Vec<u64>,
}

impl PlayingWindow {
    fn observe(&mut self, timestamp: i64, packets: Option<u64>, step_time: Option<u64>) {
        self.samples += 1;
        if let Some(st) = step_time {
            self.step_times.push(st);
        }
        let Some(packets) = packets else {
            return;
        };

        match self.last {
            // counter reset on the remote, start over from here
            Some((_, last)) if packets < last => {
                self.first = Some((timestamp, packets));
                self.samples = 1;
                self.step_times = step_time.into_iter().collect();
            }
            _ if self.first.is_none() => self.first = Some((timestamp, packets)),
            _ => {}
        }
        self.last = Some((timestamp, packets));
    }

    /// `(receive_rate, loss_pct)` rounded to one decimal
    fn packet_loss(&self) -> Option<(f64, f64)> {
        let ((first_ts, first_pkts), (last_ts, last_pkts)) = (self.first?, self.last?);
        let window = last_ts - first_ts;
        if self.samples < 2 || window <= 0 || last_pkts < first_pkts {
            return None;
        }

        let rate = (last_pkts - first_pkts) as f64 / window as f64;
        let expected = if self.step_times.is_empty() {
            DEFAULT_SYNC_RATE
        } else {
            let mut sorted = self.step_times.clone();
            sorted.sort_unstable();
            expected_sync_rate(Some(sorted[sorted.len() / 2]))
        };

        let loss = if rate >= expected {
            0.0
        } else if rate >= 0.1 {
            round_to((1.0 - rate / expected) * 100.0, 1)
        } else {
            100.0
        };
        Some((round_to(rate, 1), loss))
    }
}

#[derive(Debug, Default)]
struct HostBucket {
    address: String,
    sample_count: u64,
    latencies: Vec<f64>,
    jitters: Vec<f64>,
    playing: PlayingWindow,
    // finer rollups
    latency_stats: SampleAccumulator<f64>,
    p95_max: Option<f64>,
    jitter_stats: SampleAccumulator<f64>,
    losses: Vec<f64>,
    rates: Vec<f64>,
}

impl HostBucket {
    fn add_sample(&mut self, s: &NetworkQualitySample) {
        self.sample_count += 1;
        if let Some(latency) = s.latency {
            self.latencies.push(latency);
        }
        if let Some(jitter) = s.jitter {
            self.jitters.push(jitter);
        }
        if s.is_playing {
            self.playing
                .observe(s.timestamp, s.remote_packets_received, s.step_time);
        }
    }

    fn add_rollup(&mut self, r: &NetworkQualityRollup) {
        self.sample_count += r.sample_count;
        let weight = match r.latency_samples {
            0 => r.sample_count,
            n => n,
        };
        if let (Some(avg), Some(min), Some(max)) = (r.latency_avg, r.latency_min, r.latency_max) {
            self.latency_stats.push_stats(avg, min, max, weight);
        }
        if let Some(p95) = r.latency_p95 {
            self.p95_max = Some(self.p95_max.map_or(p95, |m| m.max(p95)));
        }
        if let Some(avg) = r.jitter_avg {
            self.jitter_stats
                .push_mean(avg, r.jitter_max.unwrap_or(avg), weight);
        }
        self.losses.extend(r.packet_loss_pct);
        self.rates.extend(r.receive_rate);
    }

    fn finish(
        self,
        hostname: String,
        start: i64,
        interval: i64,
        mode: AverageMode,
    ) -> NetworkQualityRollup {
        let latency_samples = if self.latencies.is_empty() {
            self.latency_stats.samples()
        } else {
            self.latencies.len() as u64
        };
        let (latency_min, latency_max, latency_avg, latency_p95) =
            match aggregate_latencies(&self.latencies, 1, true) {
                Some(l) => (Some(l.min), Some(l.max), Some(l.avg), l.p95),
                None => (
                    self.latency_stats.min().map(|v| round_to(v, 1)),
                    self.latency_stats.max().map(|v| round_to(v, 1)),
                    self.latency_stats.mean(mode).map(|v| round_to(v, 1)),
                    self.p95_max.map(|v| round_to(v, 1)),
                ),
            };

        let (jitter_avg, jitter_max) = if let Some(j) = jitter_from_latencies(&self.latencies) {
            (Some(j.avg), Some(j.max))
        } else if !self.jitters.is_empty() {
            let avg = self.jitters.iter().sum::<f64>() / self.jitters.len() as f64;
            let max = self.jitters.iter().copied().fold(f64::MIN, f64::max);
            (Some(round_to(avg, 2)), Some(round_to(max, 2)))
        } else {
            (
                self.jitter_stats.mean(mode).map(|v| round_to(v, 2)),
                self.jitter_stats.max().map(|v| round_to(v, 2)),
            )
        };

        let (receive_rate, packet_loss_pct) = match self.playing.packet_loss() {
            Some((rate, loss)) => (Some(rate), Some(loss)),
            None => (mean(&self.rates, 1), mean(&self.losses, 1)),
        };

        let latency_quality = latency_avg.map(|v| LATENCY_THRESHOLDS.rate(v));
        let jitter_quality = jitter_avg.map(|v| JITTER_THRESHOLDS.rate(v));
        let packet_loss_quality = packet_loss_pct.map(|v| PACKET_LOSS_THRESHOLDS.rate(v));
        let overall = overall_quality(
            [latency_quality, jitter_quality, packet_loss_quality]
                .into_iter()
                .flatten(),
        );

        NetworkQualityRollup {
            timestamp: start,
            period_start: start,
            period_end: start + interval,
            hostname,
            address: self.address,
            sample_count: self.sample_count,
            latency_samples,
            latency_min,
            latency_max,
            latency_avg,
            latency_p95,
            latency_quality,
            jitter_avg,
            jitter_max,
            jitter_quality,
            packet_loss_pct,
            packet_loss_quality,
            receive_rate,
            overall_quality: overall,
        }
    }
}

fn mean(values: &[f64], places: u32) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(round_to(
        values.iter().sum::<f64>() / values.len() as f64,
        places,
    ))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkQualityAggregator {
    pub mode: AverageMode,
}

impl Aggregator for NetworkQualityAggregator {
    type Record = NetworkQualityRecord;
    type Rollup = NetworkQualityRollup;

    /// Expects `bucket` in timestamp order, which keeps the latency
    /// series usable for jitter.
    fn aggregate(
        &self,
        bucket: &[NetworkQualityRecord],
        start: i64,
        interval: i64,
    ) -> Vec<NetworkQualityRollup> {
        let mut hosts: BTreeMap<String, HostBucket> = BTreeMap::new();

        for record in bucket {
            let (hostname, address) = match record {
                NetworkQualityRecord::Sample(s) => (&s.hostname, &s.address),
                NetworkQualityRecord::Rollup(r) => (&r.hostname, &r.address),
            };
            let name = if hostname.is_empty() {
                "unknown"
            } else {
                hostname.as_str()
            };
            let host = hosts.entry(name.to_string()).or_default();
            if host.address.is_empty() {
                host.address = address.clone();
            }

            match record {
                NetworkQualityRecord::Sample(s) => host.add_sample(s),
                NetworkQualityRecord::Rollup(r) => host.add_rollup(r),
            }
        }

        hosts
            .into_iter()
            .map(|(hostname, host)| host.finish(hostname, start, interval, self.mode))
            .collect()
    }
}

impl MetricFamily for NetworkQualityAggregator {
    type Raw = NetworkQualitySample;

    fn dimension(rollup: &NetworkQualityRollup) -> Option<&str> {
        Some(&rollup.hostname)
    }
}

fn rating_or_unknown<S>(rating: &Option<QualityRating>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match rating {
        Some(rating) => rating.serialize(serializer),
        None => serializer.serialize_str("unknown"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySummary {
    pub avg_latency: Option<f64>,
    pub avg_jitter: Option<f64>,
    pub avg_packet_loss: Option<f64>,
    /// Worst host rating, `None` (serialized as "unknown") without data
    #[serde(serialize_with = "rating_or_unknown")]
    pub overall_quality: Option<QualityRating>,
}

/// Current quality over the last hour of raw samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkQualityStatus {
    pub timestamp: i64,
    pub hosts: Vec<NetworkQualityRollup>,
    pub summary: QualitySummary,
}

pub type NetworkQualityCollector = MetricsCollector<NetworkQualityAggregator>;

impl NetworkQualityCollector {
    pub fn from_config(data_dir: &Path, config: &CollectorConfig, mode: AverageMode) -> Self {
        let paths =
            CollectorPaths::in_dir(data_dir.join(NAME)).with_raw_file(config.raw_file.clone());
        MetricsCollector::new(
            NAME,
            paths,
            TierTable::standard(),
            config.raw_retention_secs_or(DEFAULT_RAW_RETENTION_HOURS),
            NetworkQualityAggregator { mode },
        )
    }

    /// Turn one collection round into raw samples and append them.
    ///
    /// Offline remotes are skipped. Jitter comes from the response time
    /// through the caller's `jitter` state; latency and jitter get an
    /// instant quality rating.
    pub fn record_round_at(
        &self,
        player: &PlayerSnapshot,
        remotes: &[RemoteObservation],
        jitter: &mut JitterState,
        now: i64,
    ) -> StorageResult<Vec<NetworkQualitySample>> {
        let step_time = player.step_time.filter(|_| player.is_playing);

        let samples: Vec<NetworkQualitySample> = remotes
            .iter()
            .filter(|r| r.online)
            .map(|r| {
                let host_jitter = r
                    .response_time
                    .and_then(|latency| jitter.observe(&r.hostname, latency));
                NetworkQualitySample {
                    timestamp: now,
                    hostname: r.hostname.clone(),
                    address: r.address.clone(),
                    latency: r.response_time,
                    jitter: host_jitter,
                    player_packets_sent: player.packets_sent,
                    remote_packets_received: r.packets_received,
                    is_playing: player.is_playing,
                    step_time,
                    plugin_installed: r.plugin_installed,
                    latency_quality: r.response_time.map(|l| LATENCY_THRESHOLDS.rate(l)),
                    jitter_quality: host_jitter.map(|j| JITTER_THRESHOLDS.rate(j)),
                }
            })
            .collect();

        debug!("recording {} network quality samples", samples.len());
        self.write_raw(&samples)?;
        Ok(samples)
    }

    pub fn record_round(
        &self,
        player: &PlayerSnapshot,
        remotes: &[RemoteObservation],
        jitter: &mut JitterState,
    ) -> StorageResult<Vec<NetworkQualitySample>> {
        self.record_round_at(player, remotes, jitter, crate::util::unix_now())
    }

    /// Per-host summary of the last hour of raw samples
    pub fn status_at(&self, now: i64) -> StorageResult<NetworkQualityStatus> {
        let raw = self.read_raw_window_at(1, |_| true, now)?;
        let records: Vec<NetworkQualityRecord> =
            raw.into_iter().map(NetworkQualityRecord::Sample).collect();
        let hosts = if records.is_empty() {
            vec![]
        } else {
            self.family().aggregate(&records, now - 3600, 3600)
        };

        let latencies: Vec<f64> = hosts.iter().filter_map(|h| h.latency_avg).collect();
        let jitters: Vec<f64> = hosts.iter().filter_map(|h| h.jitter_avg).collect();
        let losses: Vec<f64> = hosts.iter().filter_map(|h| h.packet_loss_pct).collect();
        let overall = hosts.iter().map(|h| h.overall_quality).max();

        Ok(NetworkQualityStatus {
            timestamp: now,
            summary: QualitySummary {
                avg_latency: mean(&latencies, 1),
                avg_jitter: mean(&jitters, 2),
                avg_packet_loss: mean(&losses, 2),
                overall_quality: overall,
            },
            hosts,
        })
    }

    pub fn status(&self) -> StorageResult<NetworkQualityStatus> {
        self.status_at(crate::util::unix_now())
    }

    /// Rollups of the last `hours`, optionally for one host only
    pub fn host_metrics_at(
        &self,
        hours: i64,
        hostname: Option<&str>,
        now: i64,
    ) -> StorageResult<RollupData<NetworkQualityRollup>> {
        self.get_metrics_at(
            hours,
            |r: &NetworkQualityRollup| hostname.is_none_or(|h| r.hostname == h),
            now,
        )
    }
}
