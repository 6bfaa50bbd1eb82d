//! Metric families
//!
//! Every family shares the same engine, [`MetricsCollector`], and only
//! differs in its entry types and bucket aggregation:
//!
//! - **ping**: connectivity probes against one or more hosts
//! - **multisync_ping**: latency and jitter towards remote players
//! - **network_quality**: per-host latency, jitter and packet loss ratings
//! - **efuse**: per-port current draw in mA
//! - **voltage**: per-rail voltages

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::rollup::{RollupData, TierOutcome};
use crate::storage::{RotateOutcome, StorageError, StorageResult};

pub mod collector;
pub mod efuse;
pub mod multisync_ping;
pub mod network_quality;
pub mod ping;
pub mod voltage;

pub use collector::{CollectorPaths, MetricFamily, MetricsCollector};

/// Outcome of one tier within a rollup pass
#[derive(Debug)]
pub struct TierReport {
    pub tier: String,
    pub result: StorageResult<TierOutcome>,
}

/// Per-tier outcomes of one rollup pass over a family
#[derive(Debug)]
pub struct RollupReport {
    pub family: String,
    pub tiers: Vec<TierReport>,
}

impl RollupReport {
    pub fn new(family: &str) -> Self {
        Self {
            family: family.to_string(),
            tiers: Vec::new(),
        }
    }

    pub fn push(&mut self, tier: &str, result: StorageResult<TierOutcome>) {
        self.tiers.push(TierReport {
            tier: tier.to_string(),
            result,
        });
    }

    pub fn is_ok(&self) -> bool {
        self.tiers.iter().all(|t| t.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &StorageError)> {
        self.tiers
            .iter()
            .filter_map(|t| t.result.as_ref().err().map(|e| (t.tier.as_str(), e)))
    }

    /// Rollup entries written across all tiers
    pub fn flushed_entries(&self) -> usize {
        self.tiers
            .iter()
            .map(|t| match t.result {
                Ok(TierOutcome::Flushed { entries, .. }) => entries,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, tier: &str) -> Option<&StorageResult<TierOutcome>> {
        self.tiers.iter().find(|t| t.tier == tier).map(|t| &t.result)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSummary {
    pub tier: String,
    pub interval: i64,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Period {
    pub start: i64,
    pub end: i64,
}

/// Serializable query result for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsResponse<R> {
    pub success: bool,
    pub count: usize,
    pub data: Vec<R>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_info: Option<TierSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<R> From<StorageResult<RollupData<R>>> for MetricsResponse<R> {
    fn from(result: StorageResult<RollupData<R>>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                count: data.data.len(),
                tier_info: Some(TierSummary {
                    tier: data.tier,
                    interval: data.interval,
                    label: data.label,
                }),
                period: Some(Period {
                    start: data.start,
                    end: data.end,
                }),
                data: data.data,
                error: None,
            },
            Err(e) => Self {
                success: false,
                count: 0,
                data: Vec::new(),
                tier_info: None,
                period: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Type-erased view of a collector for the rollup scheduler
pub trait RollupTask: Send + Sync {
    fn name(&self) -> &str;

    fn process_rollup_at(&self, now: i64) -> RollupReport;

    fn rotate_raw_at(&self, now: i64) -> StorageResult<RotateOutcome>;
}

impl<F: MetricFamily> RollupTask for MetricsCollector<F> {
    fn name(&self) -> &str {
        MetricsCollector::name(self)
    }

    fn process_rollup_at(&self, now: i64) -> RollupReport {
        MetricsCollector::process_rollup_at(self, now)
    }

    fn rotate_raw_at(&self, now: i64) -> StorageResult<RotateOutcome> {
        MetricsCollector::rotate_raw_at(self, now)
    }
}

/// Every enabled family described by `config`
pub fn build_collectors(config: &Config) -> Vec<Arc<dyn RollupTask>> {
    let dir: &Path = &config.data_dir;
    let mode = config.average_mode;
    let c = &config.collectors;

    let mut tasks: Vec<Arc<dyn RollupTask>> = Vec::new();
    if c.ping.enabled {
        tasks.push(Arc::new(ping::PingCollector::from_config(dir, &c.ping, mode)));
    }
    if c.multisync_ping.enabled {
        tasks.push(Arc::new(multisync_ping::MultiSyncPingCollector::from_config(
            dir,
            &c.multisync_ping,
            mode,
        )));
    }
    if c.network_quality.enabled {
        tasks.push(Arc::new(
            network_quality::NetworkQualityCollector::from_config(dir, &c.network_quality, mode),
        ));
    }
    if c.efuse.enabled {
        tasks.push(Arc::new(efuse::EfuseCollector::from_config(dir, &c.efuse, mode)));
    }
    if c.voltage.enabled {
        tasks.push(Arc::new(voltage::VoltageCollector::from_config(dir, &c.voltage, mode)));
    }

    info!(
        "configured {} metric families under {}",
        tasks.len(),
        dir.display()
    );
    tasks
}
