//! Per-rail voltage metrics
//!
//! Tiers depend on the configured retention: short retentions only keep
//! the 1min and 5min tiers. Very old files stored a single `voltage`
//! field, which is read as the `core` rail.

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
use crate::util::round_to;

pub const NAME: &str = "voltage";

/// Rail name used for single-value readings
pub const CORE_RAIL: &str = "core";

const DEFAULT_RETENTION_DAYS: i64 = 1;
const DEFAULT_RAW_RETENTION_HOURS: i64 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageEntry {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub voltages: BTreeMap<String, SampleValue<f64>>,
    /// Single-rail field of older files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<SampleValue<f64>>,
}

impl Timestamped for VoltageEntry {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl VoltageEntry {
    pub fn reading(timestamp: i64, voltages: &BTreeMap<String, f64>) -> Self {
        Self {
            timestamp,
            interval: None,
            voltages: voltages
                .iter()
                .map(|(rail, v)| (rail.clone(), SampleValue::Scalar(*v)))
                .collect(),
            voltage: None,
        }
    }

    /// Rails of this entry, mapping the single-rail field to `core`
    pub fn rails(&self) -> BTreeMap<String, SampleValue<f64>> {
        if !self.voltages.is_empty() {
            return self.voltages.clone();
        }
        self.voltage
            .map(|v| BTreeMap::from([(CORE_RAIL.to_string(), v)]))
            .unwrap_or_default()
    }

    /// Same entry in multi-rail form
    pub fn normalized(self) -> Self {
        let voltages = self.rails();
        Self {
            voltages,
            voltage: None,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VoltageAggregator {
    pub mode: AverageMode,
    /// Configured history length, which can exceed the finest tiers
    pub retention_days: i64,
}

impl Aggregator for VoltageAggregator {
    type Record = VoltageEntry;
    type Rollup = VoltageEntry;

    fn aggregate(&self, bucket: &[VoltageEntry], start: i64, interval: i64) -> Vec<VoltageEntry> {
        let mut per_rail: BTreeMap<String, SampleAccumulator<f64>> = BTreeMap::new();
        for entry in bucket {
            for (rail, value) in entry.rails() {
                per_rail.entry(rail).or_default().push(&value);
            }
        }

        let voltages: BTreeMap<String, SampleValue<f64>> = per_rail
            .into_iter()
            .filter_map(|(rail, acc)| {
                let stats = acc.finish(self.mode)?;
                Some((
                    rail,
                    SampleValue::Aggregate(AggregateStats {
                        avg: round_to(stats.avg, 4),
                        min: round_to(stats.min, 4),
                        max: round_to(stats.max, 4),
                        peak: None,
                        samples: stats.samples,
                    }),
                ))
            })
            .collect();

        if voltages.is_empty() {
            return vec![];
        }
        vec![VoltageEntry {
            timestamp: start,
            interval: Some(interval),
            voltages,
            voltage: None,
        }]
    }
}

impl MetricFamily for VoltageAggregator {
    type Raw = VoltageEntry;
}

pub type VoltageCollector = MetricsCollector<VoltageAggregator>;

impl VoltageCollector {
    pub fn from_config(data_dir: &Path, config: &CollectorConfig, mode: AverageMode) -> Self {
        let paths =
            CollectorPaths::in_dir(data_dir.join(NAME)).with_raw_file(config.raw_file.clone());
        let retention_days = config.retention_days_or(DEFAULT_RETENTION_DAYS);
        MetricsCollector::new(
            NAME,
            paths,
            TierTable::by_retention(retention_days),
            config.raw_retention_secs_or(DEFAULT_RAW_RETENTION_HOURS),
            VoltageAggregator {
                mode,
                retention_days,
            },
        )
    }

    pub fn write_voltages_at(&self, voltages: &BTreeMap<String, f64>, now: i64) -> StorageResult<()> {
        if voltages.is_empty() {
            trace!("no voltage rails read, nothing to write");
            return Ok(());
        }
        self.write_raw(&[VoltageEntry::reading(now, voltages)])
    }

    pub fn write_voltages(&self, voltages: &BTreeMap<String, f64>) -> StorageResult<()> {
        self.write_voltages_at(voltages, crate::util::unix_now())
    }

    /// Longest window this family can serve, in hours
    pub fn max_hours(&self) -> i64 {
        self.family().retention_days * 24
    }

    /// Voltage history for a possibly fractional window.
    ///
    /// The window is capped at the retention. Up to one hour is served
    /// from raw readings (tier `raw`, interval 0) when there are any;
    /// everything else comes from the rollup tiers.
    pub fn voltage_metrics_at(&self, hours: f64, now: i64) -> StorageResult<RollupData<VoltageEntry>> {
        let hours = hours.min(self.max_hours() as f64).max(0.0);

        if hours <= 1.0 {
            let since = now - (hours * 3600.0) as i64;
            let raw = self.read_raw_window_at(1, |e| e.timestamp >= since, now)?;
            if !raw.is_empty() {
                return Ok(RollupData {
                    tier: "raw".to_string(),
                    interval: 0,
                    label: "Raw readings".to_string(),
                    start: since,
                    end: now,
                    data: raw.into_iter().map(VoltageEntry::normalized).collect(),
                });
            }
        }

        let whole_hours = (hours.ceil() as i64).max(1);
        let mut data = self.get_metrics_at(whole_hours, |_| true, now)?;
        data.data = data.data.into_iter().map(VoltageEntry::normalized).collect();
        Ok(data)
    }
}
