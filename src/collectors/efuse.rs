//! eFuse per-port current metrics
//!
//! Raw entries map port names to mA readings and always carry a
//! synthetic `_total` port with the sum of all ports. Rollups keep the
//! same shape with `{avg, min, max, peak, samples}` objects per port.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{CollectorPaths, MetricFamily, MetricsCollector};
use crate::config::CollectorConfig;
use crate::rollup::{
    AggregateStats, Aggregator, AverageMode, RollupData, SampleAccumulator, SampleValue, TierTable,
};
use crate::storage::{StorageResult, Timestamped};

pub const NAME: &str = "efuse";

/// Port holding the sum of all ports of a raw reading
pub const TOTAL_PORT: &str = "_total";

const DEFAULT_RETENTION_DAYS: i64 = 7;
const DEFAULT_RAW_RETENTION_HOURS: i64 = 6;

/// Raw reading or rollup entry, per port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfuseEntry {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default)]
    pub ports: BTreeMap<String, SampleValue<i64>>,
}

impl Timestamped for EfuseEntry {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl EfuseEntry {
    /// Raw reading with the `_total` port filled in
    pub fn reading(timestamp: i64, ports: &BTreeMap<String, i64>) -> Self {
        let mut values: BTreeMap<String, SampleValue<i64>> = ports
            .iter()
            .filter(|(name, _)| name.as_str() != TOTAL_PORT)
            .map(|(name, ma)| (name.clone(), SampleValue::Scalar(*ma)))
            .collect();
        let total = ports
            .iter()
            .filter(|(name, _)| name.as_str() != TOTAL_PORT)
            .map(|(_, ma)| ma)
            .sum();
        values.insert(TOTAL_PORT.to_string(), SampleValue::Scalar(total));

        Self {
            timestamp,
            interval: None,
            ports: values,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EfuseAggregator {
    pub mode: AverageMode,
}

impl Aggregator for EfuseAggregator {
    type Record = EfuseEntry;
    type Rollup = EfuseEntry;

    fn aggregate(&self, bucket: &[EfuseEntry], start: i64, interval: i64) -> Vec<EfuseEntry> {
        let mut per_port: BTreeMap<&str, SampleAccumulator<i64>> = BTreeMap::new();
        for entry in bucket {
            for (port, value) in &entry.ports {
                per_port.entry(port.as_str()).or_default().push(value);
            }
        }

        let ports: BTreeMap<String, SampleValue<i64>> = per_port
            .into_iter()
            .filter_map(|(port, acc)| {
                let stats = acc.finish(self.mode)?;
                Some((
                    port.to_string(),
                    SampleValue::Aggregate(AggregateStats {
                        peak: Some(stats.max),
                        ..stats
                    }),
                ))
            })
            .collect();

        if ports.is_empty() {
            return vec![];
        }
        vec![EfuseEntry {
            timestamp: start,
            interval: Some(interval),
            ports,
        }]
    }
}

impl MetricFamily for EfuseAggregator {
    type Raw = EfuseEntry;
}

/// One point of a gap-filled port series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PortPoint {
    pub timestamp: i64,
    pub value: SampleValue<i64>,
}

pub type EfuseCollector = MetricsCollector<EfuseAggregator>;

impl EfuseCollector {
    pub fn from_config(data_dir: &Path, config: &CollectorConfig, mode: AverageMode) -> Self {
        let paths =
            CollectorPaths::in_dir(data_dir.join(NAME)).with_raw_file(config.raw_file.clone());
        MetricsCollector::new(
            NAME,
            paths,
            TierTable::capped(config.retention_days_or(DEFAULT_RETENTION_DAYS)),
            config.raw_retention_secs_or(DEFAULT_RAW_RETENTION_HOURS),
            EfuseAggregator { mode },
        )
    }

    /// Append one reading of non-zero ports; empty readings are skipped
    pub fn write_ports_at(&self, ports: &BTreeMap<String, i64>, now: i64) -> StorageResult<()> {
        if ports.is_empty() {
            trace!("no active efuse ports, nothing to write");
            return Ok(());
        }
        self.write_raw(&[EfuseEntry::reading(now, ports)])
    }

    pub fn write_ports(&self, ports: &BTreeMap<String, i64>) -> StorageResult<()> {
        self.write_ports_at(ports, crate::util::unix_now())
    }

    /// Rollups of the last `hours`, optionally only entries with `port`
    pub fn port_rollups_at(
        &self,
        hours: i64,
        port: Option<&str>,
        now: i64,
    ) -> StorageResult<RollupData<EfuseEntry>> {
        self.get_metrics_at(
            hours,
            |e: &EfuseEntry| port.is_none_or(|p| e.ports.contains_key(p)),
            now,
        )
    }

    /// Evenly spaced history of one port with zeros for gaps.
    ///
    /// Up to an hour is served from raw readings spaced
    /// `raw_interval` apart, longer windows from the best rollup tier.
    pub fn port_history_at(
        &self,
        port: &str,
        hours: i64,
        raw_interval: i64,
        now: i64,
    ) -> StorageResult<Vec<PortPoint>> {
        let (entries, interval, filler) = if hours <= 1 {
            let raw = self.read_raw_window_at(hours, |e| e.ports.contains_key(port), now)?;
            (raw, raw_interval.max(1), SampleValue::Scalar(0))
        } else {
            let data = self.port_rollups_at(hours, Some(port), now)?;
            let zero = SampleValue::Aggregate(AggregateStats {
                avg: 0,
                min: 0,
                max: 0,
                peak: None,
                samples: 0,
            });
            (data.data, data.interval, zero)
        };

        let by_slot: BTreeMap<i64, SampleValue<i64>> = entries
            .iter()
            .filter_map(|e| {
                let slot = e.timestamp.div_euclid(interval) * interval;
                e.ports.get(port).map(|v| (slot, *v))
            })
            .collect();

        let first = (now - hours * 3600).div_euclid(interval) * interval;
        let last = now.div_euclid(interval) * interval;
        Ok((0..)
            .map(|i| first + i * interval)
            .take_while(|ts| *ts <= last)
            .map(|timestamp| PortPoint {
                timestamp,
                value: by_slot.get(&timestamp).copied().unwrap_or(filler),
            })
            .collect())
    }
}
