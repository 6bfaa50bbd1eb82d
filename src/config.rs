use std::path::PathBuf;

use tracing::trace;

use crate::rollup::AverageMode;

/// Per-family collector settings
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct CollectorConfig {
    /// Disabled families are neither rolled up nor rotated
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rollup retention cap in days (only used by capped families)
    pub retention_days: Option<i64>,

    /// Raw log location; defaults to `<data_dir>/<family>/raw.log`
    pub raw_file: Option<PathBuf>,

    /// Raw log retention in hours
    pub raw_retention_hours: Option<i64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            retention_days: None,
            raw_file: None,
            raw_retention_hours: None,
        }
    }
}

impl CollectorConfig {
    pub fn retention_days_or(&self, default: i64) -> i64 {
        self.retention_days.unwrap_or(default).max(1)
    }

    pub fn raw_retention_secs_or(&self, default_hours: i64) -> i64 {
        self.raw_retention_hours.unwrap_or(default_hours).max(1) * 3600
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct CollectorsConfig {
    #[serde(default)]
    pub ping: CollectorConfig,
    #[serde(default)]
    pub multisync_ping: CollectorConfig,
    #[serde(default)]
    pub network_quality: CollectorConfig,
    #[serde(default)]
    pub efuse: CollectorConfig,
    #[serde(default)]
    pub voltage: CollectorConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Config {
    /// Root directory for every family's files
    #[serde(default = "crate::util::get_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between rollup passes
    #[serde(default = "default_rollup_interval")]
    pub rollup_interval_secs: u64,

    /// Seconds between raw log rotations
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,

    /// How coarser tiers average finer rollups
    #[serde(default)]
    pub average_mode: AverageMode,

    #[serde(default)]
    pub collectors: CollectorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: crate::util::get_data_dir(),
            rollup_interval_secs: default_rollup_interval(),
            rotation_interval_secs: default_rotation_interval(),
            average_mode: AverageMode::default(),
            collectors: CollectorsConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rollup_interval() -> u64 {
    60
}

fn default_rotation_interval() -> u64 {
    1800
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
