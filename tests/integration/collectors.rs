//! Families wired up from a configuration file

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use watcher_metrics::collectors::{
    MetricsResponse, build_collectors,
    efuse::{EfuseCollector, TOTAL_PORT},
    multisync_ping::{MultiSyncPingCollector, RemotePing},
};
use watcher_metrics::config::{CollectorConfig, read_config_file};
use watcher_metrics::quality::JitterState;
use watcher_metrics::rollup::{AggregateStats, AverageMode, SampleValue};

use crate::helpers::T0;

#[test]
fn test_build_collectors_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("watcher.json");
    std::fs::write(
        &config_path,
        format!(
            r#"{{
                "data_dir": "{}",
                "collectors": {{"efuse": {{"enabled": false}}}}
            }}"#,
            dir.path().join("data").display()
        ),
    )
    .unwrap();

    let config = read_config_file(config_path.to_str().unwrap()).unwrap();
    let names: Vec<String> = build_collectors(&config)
        .iter()
        .map(|task| task.name().to_string())
        .collect();

    assert_eq!(
        names,
        vec!["ping", "multisync_ping", "network_quality", "voltage"]
    );
}

#[test]
fn test_efuse_readings_roll_up_per_port() {
    let dir = tempfile::tempdir().unwrap();
    let efuse = EfuseCollector::from_config(
        dir.path(),
        &CollectorConfig::default(),
        AverageMode::Unweighted,
    );
    efuse
        .write_ports_at(&BTreeMap::from([("Port 1".to_string(), 100)]), T0 + 10)
        .unwrap();
    efuse
        .write_ports_at(&BTreeMap::from([("Port 1".to_string(), 200)]), T0 + 20)
        .unwrap();
    efuse.write_ports_at(&BTreeMap::new(), T0 + 30).unwrap();

    assert!(efuse.process_rollup_at(T0 + 70).is_ok());

    let data = efuse.port_rollups_at(2, Some("Port 1"), T0 + 70).unwrap();
    assert_eq!(data.tier, "1min");
    assert_eq!(data.data.len(), 1);
    let expected = SampleValue::Aggregate(AggregateStats {
        avg: 150,
        min: 100,
        max: 200,
        peak: Some(200),
        samples: 2,
    });
    assert_eq!(data.data[0].ports["Port 1"], expected);
    assert_eq!(data.data[0].ports[TOTAL_PORT], expected);

    let response = MetricsResponse::from(efuse.port_rollups_at(2, Some("Port 9"), T0 + 70));
    assert!(response.success);
    assert_eq!(response.count, 0);
}

#[test]
fn test_multisync_pings_track_jitter_per_host() {
    let dir = tempfile::tempdir().unwrap();
    let collector = MultiSyncPingCollector::from_config(
        dir.path(),
        &CollectorConfig::default(),
        AverageMode::Unweighted,
    );
    let mut jitter = JitterState::new();

    for (i, latency) in [10.0, 20.0, 10.0, 50.0].into_iter().enumerate() {
        let pings = vec![
            RemotePing {
                hostname: "remote-b".to_string(),
                address: "10.0.0.2".to_string(),
                latency: Some(latency),
                success: true,
            },
            RemotePing {
                hostname: "remote-a".to_string(),
                address: "10.0.0.1".to_string(),
                latency: None,
                success: false,
            },
        ];
        collector
            .record_pings_at(&pings, &mut jitter, T0 + 5 + i as i64 * 10)
            .unwrap();
    }

    let raw = collector.raw_metrics_at(1, Some("remote-b"), T0 + 40).unwrap();
    let jitters: Vec<Option<f64>> = raw.iter().map(|s| s.jitter).collect();
    assert_eq!(jitters, vec![None, Some(0.63), Some(1.21), Some(3.64)]);

    collector.process_rollup_at(T0 + 70);
    let data = collector.host_metrics_at(1, None, T0 + 70).unwrap();

    // one rollup per host, ordered by hostname within the bucket
    assert_eq!(data.data.len(), 2);
    assert_eq!(data.data[0].hostname, "remote-a");
    assert_eq!(data.data[0].failure_count, 4);
    assert_eq!(data.data[0].avg_latency, None);

    let b = &data.data[1];
    assert_eq!(b.hostname, "remote-b");
    assert_eq!(b.success_count, 4);
    assert_eq!(b.avg_latency, Some(22.5));
    assert_eq!(b.avg_jitter, Some(1.83));
    assert_eq!(b.max_jitter, Some(3.64));
}
