//! Full tier ladder over a real data directory

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use watcher_metrics::rollup::TierOutcome;

use crate::helpers::{T0, line_count, ping_collector, pings};

#[test]
fn test_hour_of_pings_cascades_through_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let collector = ping_collector(dir.path());
    collector.write_raw(&pings(T0, 120, "8.8.8.8")).unwrap();

    let report = collector.process_rollup_at(T0 + 3_610);

    assert!(report.is_ok());
    assert_matches!(
        report.outcome("1min"),
        Some(Ok(TierOutcome::Flushed { buckets: 60, entries: 60 }))
    );
    assert_matches!(
        report.outcome("5min"),
        Some(Ok(TierOutcome::Flushed { buckets: 12, entries: 12 }))
    );
    assert_matches!(
        report.outcome("30min"),
        Some(Ok(TierOutcome::Flushed { buckets: 2, entries: 2 }))
    );
    // the two hour bucket is still open
    assert_matches!(report.outcome("2hour"), Some(Ok(TierOutcome::Idle)));
    assert_eq!(report.flushed_entries(), 74);

    let five = collector.host_metrics_at(24, None, T0 + 3_610).unwrap();
    assert_eq!(five.tier, "5min");
    assert_eq!(five.data.len(), 12);
    assert!(five.data.iter().all(|r| r.sample_count == 10));
    assert!(five.data.iter().all(|r| r.avg_latency == Some(15.0)));
    assert_eq!(five.data[0].hosts.get("8.8.8.8"), Some(&10));
}

#[test]
fn test_queries_fall_back_to_existing_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let collector = ping_collector(dir.path());
    collector.write_raw(&pings(T0, 120, "8.8.8.8")).unwrap();
    collector.process_rollup_at(T0 + 3_610);

    // one hour back from now excludes the very first minute
    let recent = collector.host_metrics_at(1, None, T0 + 3_610).unwrap();
    assert_eq!(recent.tier, "1min");
    assert_eq!(recent.data.len(), 59);

    // 30 days would be served by the 2hour tier, which has no file yet
    let month = collector.host_metrics_at(30 * 24, None, T0 + 3_610).unwrap();
    assert_eq!(month.tier, "30min");
    assert_eq!(month.data.len(), 2);

    let other_host = collector
        .host_metrics_at(24, Some("1.1.1.1"), T0 + 3_610)
        .unwrap();
    assert!(other_host.data.is_empty());
}

#[test]
fn test_restart_does_not_duplicate_rollups() {
    let dir = tempfile::tempdir().unwrap();
    ping_collector(dir.path())
        .write_raw(&pings(T0, 120, "8.8.8.8"))
        .unwrap();
    ping_collector(dir.path()).process_rollup_at(T0 + 3_610);

    let restarted = ping_collector(dir.path());
    let report = restarted.process_rollup_at(T0 + 3_670);

    assert_matches!(report.outcome("1min"), Some(Ok(TierOutcome::Idle)));
    assert_matches!(report.outcome("5min"), Some(Ok(TierOutcome::Throttled)));
    let minute_file = restarted.rollup_file(restarted.tiers().get("1min").unwrap());
    assert_eq!(line_count(&minute_file), 60);
}

#[test]
fn test_new_samples_extend_cascade() {
    let dir = tempfile::tempdir().unwrap();
    let collector = ping_collector(dir.path());
    collector.write_raw(&pings(T0, 120, "8.8.8.8")).unwrap();
    collector.process_rollup_at(T0 + 3_610);

    collector.write_raw(&pings(T0 + 3_600, 10, "8.8.8.8")).unwrap();
    let report = collector.process_rollup_at(T0 + 3_910);

    assert_matches!(
        report.outcome("1min"),
        Some(Ok(TierOutcome::Flushed { buckets: 5, entries: 5 }))
    );
    assert_matches!(
        report.outcome("5min"),
        Some(Ok(TierOutcome::Flushed { buckets: 1, entries: 1 }))
    );
    assert_matches!(report.outcome("30min"), Some(Ok(TierOutcome::Throttled)));

    let state = collector.rollup_state().unwrap();
    assert_eq!(state.cursor("1min").last_bucket_end, T0 + 3_900);
    assert_eq!(state.cursor("5min").last_bucket_end, T0 + 3_900);
    assert_eq!(state.cursor("30min").last_bucket_end, T0 + 3_600);
}

#[test]
fn test_short_burst_survives_source_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let collector = ping_collector(dir.path());
    // two probes, then nothing for seven hours
    collector.write_raw(&pings(T0 + 5, 2, "8.8.8.8")).unwrap();

    let report = collector.process_rollup_at(T0 + 70);
    assert_matches!(
        report.outcome("1min"),
        Some(Ok(TierOutcome::Flushed { buckets: 1, entries: 1 }))
    );
    assert_matches!(report.outcome("5min"), Some(Ok(TierOutcome::Idle)));

    let mut now = T0 + 70;
    while now < T0 + 7 * 3_600 {
        now += 300;
        assert!(collector.process_rollup_at(now).is_ok());
    }

    let tiers = collector.tiers();
    // the 1min entry is past its six hour retention by now
    assert_eq!(line_count(&collector.rollup_file(tiers.get("1min").unwrap())), 0);
    for name in ["5min", "30min", "2hour"] {
        assert_eq!(line_count(&collector.rollup_file(tiers.get(name).unwrap())), 1, "{name}");
    }

    let day = collector.host_metrics_at(24, None, now).unwrap();
    assert_eq!(day.tier, "5min");
    assert_eq!(day.data.len(), 1);
    assert_eq!(day.data[0].period_start, T0);
    assert_eq!(day.data[0].sample_count, 2);
    assert_eq!(day.data[0].avg_latency, Some(15.0));
}

#[test]
fn test_reset_state_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let collector = ping_collector(dir.path());
    collector.write_raw(&pings(T0, 4, "8.8.8.8")).unwrap();
    collector.process_rollup_at(T0 + 130);

    collector.reset_state().unwrap();
    assert!(!collector.state_file().exists());

    let state = collector.rollup_state().unwrap();
    assert_eq!(state.cursor("1min").last_bucket_end, 0);
    // resetting twice is fine
    collector.reset_state().unwrap();
}
