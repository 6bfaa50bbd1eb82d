use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace, warn};

use super::aggregate::Aggregator;
use super::state::{RollupState, TierCursor, load_state, save_state};
use super::tier::{Tier, TierInfo, TierTable, format_duration, format_interval};
use crate::storage::{MetricsStorage, StorageResult, Timestamped};

/// Everything one tier pass needs to know about its files
#[derive(Debug, Clone, Copy)]
pub struct TierJob<'a> {
    pub tier: &'a Tier,
    /// Cursor document shared by all tiers of the family
    pub state_file: &'a Path,
    /// Raw log or the finer tier's rollup file
    pub source_file: &'a Path,
    /// Name of the finer tier when cascading; its watermark bounds ours
    pub source_tier: Option<&'a str>,
    pub rollup_file: &'a Path,
}

/// Result of one tier pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    /// Ran less than one interval ago
    Throttled,
    /// Nothing new to roll up
    Idle,
    /// Closed buckets were written
    Flushed { buckets: usize, entries: usize },
}

/// Rollup entries of one tier within a time range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupData<R> {
    pub tier: String,
    pub interval: i64,
    pub label: String,
    pub start: i64,
    pub end: i64,
    pub data: Vec<R>,
}

/// Drives tier passes and reads for one tier table
#[derive(Debug, Clone)]
pub struct RollupProcessor {
    tiers: TierTable,
    storage: MetricsStorage,
}

impl RollupProcessor {
    pub fn new(tiers: TierTable) -> Self {
        Self {
            tiers,
            storage: MetricsStorage::new(),
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn best_tier_for_hours(&self, hours: i64) -> Option<&Tier> {
        self.tiers.best_tier_for_hours(hours)
    }

    pub fn load_state(&self, path: &Path) -> StorageResult<RollupState> {
        load_state(path, &self.tiers)
    }

    pub fn save_state(&self, path: &Path, state: &RollupState) -> StorageResult<()> {
        save_state(path, state)
    }

    /// Run one tier pass using the wall clock
    pub fn process_tier<A: Aggregator>(
        &self,
        job: &TierJob<'_>,
        aggregator: &A,
    ) -> StorageResult<TierOutcome> {
        self.process_tier_at(job, aggregator, crate::util::unix_now())
    }

    /// Roll closed buckets of `job.source_file` into `job.rollup_file`.
    ///
    /// A bucket is emitted only once it has fully elapsed (its end is at
    /// most `now - 1`) and only if it ends after the last emitted bucket.
    /// Cascading tiers also wait for the source tier's watermark to reach
    /// the bucket end, for at most one source interval.
    /// The cursor advances only past buckets that actually produced
    /// entries.
    #[instrument(skip(self, job, aggregator), fields(tier = %job.tier.name))]
    pub fn process_tier_at<A: Aggregator>(
        &self,
        job: &TierJob<'_>,
        aggregator: &A,
        now: i64,
    ) -> StorageResult<TierOutcome> {
        let tier = job.tier;
        let mut state = self.load_state(job.state_file)?;
        let mut cursor = state.cursor(&tier.name);

        if now - cursor.last_rollup < tier.interval {
            trace!("tier {} ran {}s ago, skipping", tier.name, now - cursor.last_rollup);
            return Ok(TierOutcome::Throttled);
        }

        let records: Vec<A::Record> = self.storage.read(job.source_file, cursor.last_processed)?;

        // a cascading bucket waits for the source watermark, but never
        // longer than one source interval past its end
        let source = job.source_tier.map(|name| {
            let grace = self.tiers.get(name).map_or(0, |t| t.interval);
            (state.cursor(name).last_bucket_end, grace)
        });
        let is_closed = |end: i64| {
            end <= now - 1
                && source.is_none_or(|(watermark, grace)| end <= watermark || end + grace <= now - 1)
        };

        let (buckets, rollups, latest_end) =
            close_buckets(aggregator, tier, &records, cursor, is_closed);

        if !rollups.is_empty() {
            self.storage.append(job.rollup_file, &rollups)?;
            cursor.last_processed = latest_end - 1;
            cursor.last_bucket_end = latest_end;
        }
        cursor.last_rollup = now;
        state.set_cursor(&tier.name, cursor);
        self.save_state(job.state_file, &state)?;

        if let Err(e) = self
            .storage
            .rotate_at(job.rollup_file, tier.retention, now)
        {
            warn!("failed to rotate {}: {}", job.rollup_file.display(), e);
        }

        if rollups.is_empty() {
            return Ok(TierOutcome::Idle);
        }
        debug!(
            "tier {}: flushed {} buckets ({} entries) up to {}",
            tier.name,
            buckets,
            rollups.len(),
            latest_end
        );
        Ok(TierOutcome::Flushed {
            buckets,
            entries: rollups.len(),
        })
    }

    /// Append already aggregated entries to a rollup file
    pub fn append_rollup_entries<R>(&self, file: &Path, entries: &[R]) -> StorageResult<()>
    where
        R: Serialize + Timestamped,
    {
        self.storage.append(file, entries)
    }

    /// Entries of `tier` with `start <= timestamp <= end` that pass
    /// `filter`, sorted by timestamp.
    ///
    /// `start = None` means `end - retention`. A missing file is
    /// [`StorageError::NotFound`].
    pub fn read_rollup_data<R, F>(
        &self,
        file: &Path,
        tier: &Tier,
        start: Option<i64>,
        end: i64,
        filter: F,
    ) -> StorageResult<RollupData<R>>
    where
        R: DeserializeOwned + Timestamped,
        F: Fn(&R) -> bool,
    {
        let start = start.unwrap_or(end - tier.retention);
        let data = self.storage.scan(file, start - 1, |entry: &R| {
            entry.timestamp() <= end && filter(entry)
        })?;

        Ok(RollupData {
            tier: tier.name.clone(),
            interval: tier.interval,
            label: tier.label.clone(),
            start,
            end,
            data,
        })
    }

    /// Tier descriptions plus file presence and size
    pub fn tiers_info<F>(&self, rollup_file: F) -> Vec<TierInfo>
    where
        F: Fn(&Tier) -> PathBuf,
    {
        self.tiers
            .iter()
            .map(|tier| {
                let file = rollup_file(tier);
                let meta = fs::metadata(&file).ok();
                TierInfo {
                    name: tier.name.clone(),
                    interval: tier.interval,
                    interval_label: format_interval(tier.interval),
                    retention: tier.retention,
                    retention_label: format_duration(tier.retention),
                    label: tier.label.clone(),
                    file_exists: meta.is_some(),
                    file_size: meta.map(|m| m.len()).unwrap_or(0),
                    file,
                }
            })
            .collect()
    }
}

/// Group `records` into buckets and aggregate every eligible one.
///
/// Returns the number of productive buckets, the rollup entries and the
/// end of the newest productive bucket.
fn close_buckets<A: Aggregator>(
    aggregator: &A,
    tier: &Tier,
    records: &[A::Record],
    cursor: TierCursor,
    is_closed: impl Fn(i64) -> bool,
) -> (usize, Vec<A::Rollup>, i64) {
    let mut productive = 0;
    let mut rollups = Vec::new();
    let mut latest_end = cursor.last_bucket_end;

    // records arrive sorted by timestamp, so buckets are contiguous runs
    let mut rest = records;
    while let Some(first) = rest.first() {
        let start = tier.bucket_start(first.timestamp());
        let end = start + tier.interval;
        let len = rest
            .iter()
            .position(|r| r.timestamp() >= end)
            .unwrap_or(rest.len());
        let (bucket, tail) = rest.split_at(len);
        rest = tail;

        if end <= cursor.last_bucket_end || !is_closed(end) {
            continue;
        }

        let entries = aggregator.aggregate(bucket, start, tier.interval);
        if entries.is_empty() {
            continue;
        }
        productive += 1;
        latest_end = latest_end.max(end);
        rollups.extend(entries);
    }

    (productive, rollups, latest_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick {
        timestamp: i64,
        value: i64,
    }

    impl Timestamped for Tick {
        fn timestamp(&self) -> i64 {
            self.timestamp
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sum {
        timestamp: i64,
        total: i64,
        count: usize,
    }

    impl Timestamped for Sum {
        fn timestamp(&self) -> i64 {
            self.timestamp
        }
    }

    /// Sums values; buckets whose values are all negative yield nothing
    struct Summer;

    impl Aggregator for Summer {
        type Record = Tick;
        type Rollup = Sum;

        fn aggregate(&self, bucket: &[Tick], start: i64, _interval: i64) -> Vec<Sum> {
            let kept: Vec<&Tick> = bucket.iter().filter(|t| t.value >= 0).collect();
            if kept.is_empty() {
                return vec![];
            }
            vec![Sum {
                timestamp: start,
                total: kept.iter().map(|t| t.value).sum(),
                count: kept.len(),
            }]
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        raw: PathBuf,
        state: PathBuf,
        rollup: PathBuf,
        tier: Tier,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                raw: dir.path().join("raw.log"),
                state: dir.path().join("state.json"),
                rollup: dir.path().join("1min.log"),
                tier: TierTable::standard().get("1min").unwrap().clone(),
                _dir: dir,
            }
        }

        fn job(&self) -> TierJob<'_> {
            TierJob {
                tier: &self.tier,
                state_file: &self.state,
                source_file: &self.raw,
                source_tier: None,
                rollup_file: &self.rollup,
            }
        }

        fn write(&self, ticks: &[(i64, i64)]) {
            let ticks: Vec<Tick> = ticks
                .iter()
                .map(|&(timestamp, value)| Tick { timestamp, value })
                .collect();
            MetricsStorage::new().append(&self.raw, &ticks).unwrap();
        }

        fn rollups(&self) -> Vec<Sum> {
            MetricsStorage::new().read(&self.rollup, 0).unwrap()
        }
    }

    fn processor() -> RollupProcessor {
        RollupProcessor::new(TierTable::standard())
    }

    #[test]
    fn test_only_closed_buckets_are_emitted() {
        let fx = Fixture::new();
        fx.write(&[(6_000, 1), (6_030, 2), (6_060, 5)]);

        let outcome = processor().process_tier_at(&fx.job(), &Summer, 6_090).unwrap();

        assert_eq!(outcome, TierOutcome::Flushed { buckets: 1, entries: 1 });
        assert_eq!(
            fx.rollups(),
            vec![Sum {
                timestamp: 6_000,
                total: 3,
                count: 2
            }]
        );
        let cursor = processor().load_state(&fx.state).unwrap().cursor("1min");
        assert_eq!(
            cursor,
            TierCursor {
                last_processed: 6_059,
                last_bucket_end: 6_060,
                last_rollup: 6_090,
            }
        );
    }

    #[test]
    fn test_bucket_closing_exactly_at_now_waits() {
        let fx = Fixture::new();
        fx.write(&[(6_000, 1)]);

        let outcome = processor().process_tier_at(&fx.job(), &Summer, 6_060).unwrap();
        assert_eq!(outcome, TierOutcome::Idle);

        let outcome = processor().process_tier_at(&fx.job(), &Summer, 6_121).unwrap();
        assert_eq!(outcome, TierOutcome::Flushed { buckets: 1, entries: 1 });
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let fx = Fixture::new();
        fx.write(&[(6_000, 1), (6_070, 2)]);
        let p = processor();

        p.process_tier_at(&fx.job(), &Summer, 7_000).unwrap();
        let first = fx.rollups();
        let outcome = p.process_tier_at(&fx.job(), &Summer, 7_100).unwrap();

        assert_eq!(outcome, TierOutcome::Idle);
        assert_eq!(fx.rollups(), first);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_throttle_within_interval() {
        let fx = Fixture::new();
        fx.write(&[(6_000, 1)]);
        let p = processor();

        p.process_tier_at(&fx.job(), &Summer, 6_100).unwrap();
        fx.write(&[(6_100, 4)]);

        assert_eq!(
            p.process_tier_at(&fx.job(), &Summer, 6_150).unwrap(),
            TierOutcome::Throttled
        );
        assert_eq!(
            p.process_tier_at(&fx.job(), &Summer, 6_200).unwrap(),
            TierOutcome::Flushed { buckets: 1, entries: 1 }
        );
    }

    #[test]
    fn test_empty_bucket_result_does_not_advance_cursor() {
        let fx = Fixture::new();
        fx.write(&[(6_000, -1), (6_070, -1)]);
        let p = processor();

        assert_eq!(
            p.process_tier_at(&fx.job(), &Summer, 7_000).unwrap(),
            TierOutcome::Idle
        );
        let cursor = p.load_state(&fx.state).unwrap().cursor("1min");
        assert_eq!((cursor.last_processed, cursor.last_bucket_end), (0, 0));
        assert_eq!(cursor.last_rollup, 7_000);
        assert!(!fx.rollup.exists());
    }

    #[test]
    fn test_late_entries_for_emitted_bucket_are_ignored() {
        let fx = Fixture::new();
        fx.write(&[(6_000, 1), (6_070, 2)]);
        let p = processor();
        p.process_tier_at(&fx.job(), &Summer, 7_000).unwrap();

        // a straggler for the already emitted 6060 bucket
        fx.write(&[(6_119, 100)]);
        let outcome = p.process_tier_at(&fx.job(), &Summer, 7_100).unwrap();

        assert_eq!(outcome, TierOutcome::Idle);
        assert_eq!(fx.rollups().len(), 2);
    }

    struct Resum;

    impl Aggregator for Resum {
        type Record = Sum;
        type Rollup = Sum;
        fn aggregate(&self, bucket: &[Sum], start: i64, _interval: i64) -> Vec<Sum> {
            vec![Sum {
                timestamp: start,
                total: bucket.iter().map(|s| s.total).sum(),
                count: bucket.iter().map(|s| s.count).sum(),
            }]
        }
    }

    #[test]
    fn test_cascade_cutoff_respects_source_watermark() {
        let fx = Fixture::new();
        let five = TierTable::standard().get("5min").unwrap().clone();
        let five_file = fx.rollup.with_file_name("5min.log");
        let p = processor();

        fx.write(&[(6_000, 1), (6_240, 1), (6_300, 1)]);
        p.process_tier_at(&fx.job(), &Summer, 6_361).unwrap();

        let cascade = TierJob {
            tier: &five,
            state_file: &fx.state,
            source_file: &fx.rollup,
            source_tier: Some("1min"),
            rollup_file: &five_file,
        };

        // 1min watermark is 6360, so the 6000..6300 bucket may close
        let outcome = p.process_tier_at(&cascade, &Resum, 6_361).unwrap();
        assert_eq!(outcome, TierOutcome::Flushed { buckets: 1, entries: 1 });

        let five_min: Vec<Sum> = MetricsStorage::new().read(&five_file, 0).unwrap();
        assert_eq!(
            five_min,
            vec![Sum {
                timestamp: 6_000,
                total: 2,
                count: 2
            }]
        );
    }

    #[test]
    fn test_cascade_closes_after_source_grace_without_new_data() {
        let fx = Fixture::new();
        let five = TierTable::standard().get("5min").unwrap().clone();
        let five_file = fx.rollup.with_file_name("5min.log");
        let p = processor();

        // data stops after 6030, so the 1min watermark stays at 6060
        fx.write(&[(6_000, 1), (6_030, 2)]);
        p.process_tier_at(&fx.job(), &Summer, 6_100).unwrap();
        assert_eq!(p.load_state(&fx.state).unwrap().cursor("1min").last_bucket_end, 6_060);

        let cascade = TierJob {
            tier: &five,
            state_file: &fx.state,
            source_file: &fx.rollup,
            source_tier: Some("1min"),
            rollup_file: &five_file,
        };

        // bucket 6000..6300 has ended but is inside the 1min grace period
        let outcome = p.process_tier_at(&cascade, &Resum, 6_330).unwrap();
        assert_eq!(outcome, TierOutcome::Idle);

        // one source interval later it closes even though 1min never moved
        let outcome = p.process_tier_at(&cascade, &Resum, 6_700).unwrap();
        assert_eq!(outcome, TierOutcome::Flushed { buckets: 1, entries: 1 });

        let five_min: Vec<Sum> = MetricsStorage::new().read(&five_file, 0).unwrap();
        assert_eq!(
            five_min,
            vec![Sum {
                timestamp: 6_000,
                total: 3,
                count: 2
            }]
        );
        assert_eq!(p.load_state(&fx.state).unwrap().cursor("5min").last_bucket_end, 6_300);
    }

    #[test]
    fn test_read_rollup_data_range_and_filter() {
        let fx = Fixture::new();
        let p = processor();
        let entries: Vec<Sum> = (0..5)
            .map(|i| Sum {
                timestamp: 6_000 + i * 60,
                total: i,
                count: 1,
            })
            .collect();
        p.append_rollup_entries(&fx.rollup, &entries).unwrap();

        let data: RollupData<Sum> = p
            .read_rollup_data(&fx.rollup, &fx.tier, Some(6_060), 6_180, |s: &Sum| s.total != 2)
            .unwrap();

        assert_eq!(data.tier, "1min");
        assert_eq!(
            data.data.iter().map(|s| s.timestamp).collect::<Vec<_>>(),
            vec![6_060, 6_180]
        );
    }

    #[test]
    fn test_read_rollup_data_missing_file() {
        let fx = Fixture::new();
        let result: StorageResult<RollupData<Sum>> =
            processor().read_rollup_data(&fx.rollup, &fx.tier, None, 10_000, |_| true);
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_tiers_info_reports_files() {
        let fx = Fixture::new();
        fx.write(&[(1, 1)]);
        let dir = fx.raw.parent().unwrap().to_path_buf();
        MetricsStorage::new()
            .append(&fx.rollup, &[Sum { timestamp: 60, total: 1, count: 1 }])
            .unwrap();

        let info = processor().tiers_info(|t| dir.join(t.file_name()));

        assert_eq!(info.len(), 4);
        assert!(info[0].file_exists);
        assert!(info[0].file_size > 0);
        assert_eq!(info[0].interval_label, "1 minutes");
        assert!(!info[3].file_exists);
        assert_eq!(info[3].retention_label, "90 days");
    }
}
