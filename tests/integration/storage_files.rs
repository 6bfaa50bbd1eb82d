//! Line log behaviour against real files

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use pretty_assertions::assert_eq;
use watcher_metrics::collectors::ping::PingSample;
use watcher_metrics::storage::{MetricsStorage, StorageError};

const OLD: &str =
    r#"[2023-11-14 22:00:00] {"timestamp":100,"host":"a","latency":1.0,"status":"success"}"#;
const BARE: &str = r#"{"timestamp":200,"host":"a","latency":2.0,"status":"success"}"#;
const FRESH: &str =
    r#"[2023-11-14 22:05:00] {"timestamp":300,"host":"b","latency":3.0,"status":"success"}"#;

fn seeded_contents() -> String {
    format!("{OLD}\n{BARE}\nnot a metrics line\n{FRESH}\n")
}

fn seeded_log(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("raw.log");
    std::fs::write(&path, seeded_contents()).unwrap();
    path
}

#[test]
fn test_concurrent_appends_keep_every_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = Arc::new(dir.path().join("nested").join("raw.log"));

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                let storage = MetricsStorage::new();
                for i in 0..50 {
                    let ts = 1_000 + i * 8 + w;
                    storage
                        .append(&path, &[PingSample::success(ts, "host", 1.0)])
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let entries: Vec<PingSample> = MetricsStorage::new().read(&path, 0).unwrap();
    assert_eq!(entries.len(), 400);
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn test_read_accepts_stamped_and_bare_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded_log(dir.path());
    let storage = MetricsStorage::new();

    let all: Vec<PingSample> = storage.read(&path, 0).unwrap();
    assert_eq!(
        all.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
        vec![100, 200, 300]
    );

    // the lower bound is exclusive
    let newer: Vec<PingSample> = storage.read(&path, 200).unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].host, "b");
}

#[test]
fn test_scan_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = MetricsStorage::new().scan::<PingSample, _>(&dir.path().join("nope.log"), 0, |_| true);

    assert!(matches!(result, Err(StorageError::NotFound(_))));
}

#[test]
fn test_rotation_keeps_survivor_bytes_and_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded_log(dir.path());
    let original = std::fs::read_to_string(&path).unwrap();

    let outcome = MetricsStorage::new().rotate_at(&path, 100, 350).unwrap();

    assert_eq!(outcome.purged, 2);
    assert_eq!(outcome.kept, 1);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), format!("{FRESH}\n"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("raw.log.old")).unwrap(),
        original
    );
    assert!(!dir.path().join("raw.log.tmp").exists());
}

#[test]
fn test_rotation_without_expired_entries_leaves_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded_log(dir.path());
    let original = std::fs::read_to_string(&path).unwrap();

    let outcome = MetricsStorage::new().rotate_at(&path, 1_000, 350).unwrap();

    assert_eq!(outcome.purged, 0);
    assert!(!outcome.rewrote());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    assert!(!dir.path().join("raw.log.old").exists());
}

#[test]
fn test_readers_never_see_a_half_rotated_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = Arc::new(seeded_log(dir.path()));
    let staging = dir.path().join("raw.log.seed");
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let path = Arc::clone(&path);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let storage = MetricsStorage::new();
            let mut seen = Vec::new();
            while !done.load(Ordering::SeqCst) {
                let entries: Vec<PingSample> = storage.read(&path, 0).unwrap();
                seen.push(entries.iter().map(|e| e.timestamp).collect::<Vec<_>>());
            }
            seen
        })
    };

    let storage = MetricsStorage::new();
    for _ in 0..200 {
        let outcome = storage.rotate_at(&path, 100, 350).unwrap();
        assert_eq!(outcome.purged, 2);
        // put the expired entries back in one atomic step
        std::fs::write(&staging, seeded_contents()).unwrap();
        std::fs::rename(&staging, path.as_path()).unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let seen = reader.join().unwrap();
    assert!(!seen.is_empty());
    for timestamps in seen {
        assert!(
            timestamps == [100, 200, 300] || timestamps == [300],
            "reader saw {timestamps:?}"
        );
    }
}
