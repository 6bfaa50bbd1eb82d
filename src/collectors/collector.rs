use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument};

use crate::rollup::{
    Aggregator, RollupData, RollupProcessor, RollupState, Tier, TierInfo, TierJob, TierTable,
};
use crate::storage::{MetricsStorage, RotateOutcome, StorageError, StorageResult, Timestamped};

use super::RollupReport;

/// A metric family: its raw entry type plus how buckets aggregate
pub trait MetricFamily: Aggregator + Send + Sync + 'static {
    /// Entry appended to the raw log by the producer
    type Raw: Serialize + DeserializeOwned + Timestamped;

    /// Secondary ordering key for multi-host rollups
    fn dimension(_rollup: &Self::Rollup) -> Option<&str> {
        None
    }
}

/// Where a family keeps its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorPaths {
    pub dir: PathBuf,
    pub raw_file: PathBuf,
    pub state_file: PathBuf,
}

impl CollectorPaths {
    /// `raw.log`, `rollup-state.json` and the tier files all inside `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            raw_file: dir.join("raw.log"),
            state_file: dir.join("rollup-state.json"),
            dir,
        }
    }

    pub fn with_raw_file(mut self, raw_file: Option<PathBuf>) -> Self {
        if let Some(raw_file) = raw_file {
            self.raw_file = raw_file;
        }
        self
    }

    pub fn rollup_file(&self, tier: &Tier) -> PathBuf {
        self.dir.join(tier.file_name())
    }
}

/// Raw log, tier files and cursors of one metric family
#[derive(Debug)]
pub struct MetricsCollector<F> {
    name: String,
    paths: CollectorPaths,
    raw_retention: i64,
    processor: RollupProcessor,
    storage: MetricsStorage,
    family: F,
}

impl<F: MetricFamily> MetricsCollector<F> {
    pub fn new(
        name: &str,
        paths: CollectorPaths,
        tiers: TierTable,
        raw_retention: i64,
        family: F,
    ) -> Self {
        Self {
            name: name.to_string(),
            paths,
            raw_retention,
            processor: RollupProcessor::new(tiers),
            storage: MetricsStorage::new(),
            family,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &CollectorPaths {
        &self.paths
    }

    pub fn tiers(&self) -> &TierTable {
        self.processor.tiers()
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    /// Raw log retention in seconds
    pub fn raw_retention(&self) -> i64 {
        self.raw_retention
    }

    pub fn rollup_file(&self, tier: &Tier) -> PathBuf {
        self.paths.rollup_file(tier)
    }

    /// Append raw entries as one batch
    pub fn write_raw(&self, entries: &[F::Raw]) -> StorageResult<()> {
        self.storage.append(&self.paths.raw_file, entries)
    }

    /// Raw entries newer than `since`, oldest first
    pub fn read_raw(&self, since: i64) -> StorageResult<Vec<F::Raw>> {
        self.storage.read(&self.paths.raw_file, since)
    }

    /// Raw entries of the last `hours` that pass `filter`
    pub fn read_raw_window_at<P>(&self, hours: i64, filter: P, now: i64) -> StorageResult<Vec<F::Raw>>
    where
        P: Fn(&F::Raw) -> bool,
    {
        let start = now - hours * 3600;
        match self.storage.scan(&self.paths.raw_file, start - 1, |entry: &F::Raw| {
            entry.timestamp() <= now && filter(entry)
        }) {
            Err(e) if e.is_not_found() => Ok(vec![]),
            other => other,
        }
    }

    pub fn read_raw_window<P>(&self, hours: i64, filter: P) -> StorageResult<Vec<F::Raw>>
    where
        P: Fn(&F::Raw) -> bool,
    {
        self.read_raw_window_at(hours, filter, crate::util::unix_now())
    }

    pub fn process_rollup(&self) -> RollupReport {
        self.process_rollup_at(crate::util::unix_now())
    }

    /// One pass over every tier, finest first.
    ///
    /// The finest tier reads the raw log, each coarser one reads the
    /// rollup file of the tier below. A failing tier is logged and
    /// recorded in the report; the remaining tiers still run.
    #[instrument(skip(self), fields(family = %self.name))]
    pub fn process_rollup_at(&self, now: i64) -> RollupReport {
        let mut report = RollupReport::new(&self.name);

        for tier in self.tiers().iter() {
            let source_tier = self.tiers().previous(&tier.name);
            let source_file = source_tier
                .map(|t| self.rollup_file(t))
                .unwrap_or_else(|| self.paths.raw_file.clone());
            let rollup_file = self.rollup_file(tier);

            let job = TierJob {
                tier,
                state_file: &self.paths.state_file,
                source_file: &source_file,
                source_tier: source_tier.map(|t| t.name.as_str()),
                rollup_file: &rollup_file,
            };

            let result = self.processor.process_tier_at(&job, &self.family, now);
            if let Err(e) = &result {
                error!("{} rollup for tier {} failed: {}", self.name, tier.name, e);
            }
            report.push(&tier.name, result);
        }

        report
    }

    pub fn rotate_raw(&self) -> StorageResult<RotateOutcome> {
        self.rotate_raw_at(crate::util::unix_now())
    }

    pub fn rotate_raw_at(&self, now: i64) -> StorageResult<RotateOutcome> {
        self.storage
            .rotate_at(&self.paths.raw_file, self.raw_retention, now)
    }

    pub fn get_metrics<P>(&self, hours: i64, filter: P) -> StorageResult<RollupData<F::Rollup>>
    where
        P: Fn(&F::Rollup) -> bool,
    {
        self.get_metrics_at(hours, filter, crate::util::unix_now())
    }

    /// Rollups covering the last `hours` from the best tier.
    ///
    /// When the preferred tier has no file yet the next finer tier with
    /// a file is used. Multi-host families come back ordered by
    /// timestamp, then host.
    #[instrument(skip(self, filter), fields(family = %self.name))]
    pub fn get_metrics_at<P>(
        &self,
        hours: i64,
        filter: P,
        now: i64,
    ) -> StorageResult<RollupData<F::Rollup>>
    where
        P: Fn(&F::Rollup) -> bool,
    {
        let tiers = self.tiers();
        let tier = tiers
            .best_available_tier(hours, |t| self.rollup_file(t).exists())
            .or_else(|| tiers.best_tier_for_hours(hours))
            .ok_or_else(|| StorageError::NotFound(self.paths.dir.clone()))?;
        debug!("serving {}h of {} from tier {}", hours, self.name, tier.name);

        let mut data = self.processor.read_rollup_data(
            &self.rollup_file(tier),
            tier,
            Some(now - hours * 3600),
            now,
            filter,
        )?;
        data.data.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| F::dimension(a).cmp(&F::dimension(b)))
        });
        Ok(data)
    }

    pub fn tiers_info(&self) -> Vec<TierInfo> {
        self.processor.tiers_info(|t| self.rollup_file(t))
    }

    pub fn rollup_state(&self) -> StorageResult<RollupState> {
        self.processor.load_state(&self.paths.state_file)
    }

    /// Delete the cursor document so every tier starts over
    pub fn reset_state(&self) -> StorageResult<()> {
        match fs::remove_file(&self.paths.state_file) {
            Ok(()) => {
                info!("reset rollup state of {}", self.name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.paths.state_file
    }
}
