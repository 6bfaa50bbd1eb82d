//! Rollup scheduler over real collectors

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use watcher_metrics::actors::rollup::RollupHandle;
use watcher_metrics::collectors::RollupTask;
use watcher_metrics::util::unix_now;

use crate::helpers::{line_count, ping_collector, pings};

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_scheduler_rolls_up_and_rotates() {
    let dir = tempfile::tempdir().unwrap();
    let collector = Arc::new(ping_collector(dir.path()));

    // a stale day-old probe plus ten minutes of closed buckets
    let now = unix_now();
    let start = (now - 900).div_euclid(60) * 60;
    collector
        .write_raw(&pings(now - 30 * 3600, 1, "8.8.8.8"))
        .unwrap();
    collector.write_raw(&pings(start, 20, "8.8.8.8")).unwrap();

    let handle = RollupHandle::spawn(vec![collector.clone() as Arc<dyn RollupTask>], HOUR, HOUR);

    // either this or the first scheduled tick flushes; the other is throttled
    let pass = handle.run_now().await.unwrap();
    assert_eq!(pass.families, 1);
    assert_eq!(pass.failed_tiers, 0);

    let rotation = handle.rotate_now().await.unwrap();
    assert_eq!(rotation.files, 1);
    assert_eq!(rotation.failures, 0);

    let stats = handle.get_stats().await.unwrap();
    assert!(stats.passes >= 1);
    assert!(stats.flushed_entries > 0);
    assert_eq!(stats.failed_tiers, 0);

    let minute_file = collector.rollup_file(collector.tiers().get("1min").unwrap());
    assert!(line_count(&minute_file) >= 10);
    // the day-old probe is past the 25h raw retention
    assert_eq!(line_count(&collector.paths().raw_file), 20);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_closed());
}
