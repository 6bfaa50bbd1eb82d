use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use watcher_metrics::{
    actors::rollup::RollupHandle,
    collectors::build_collectors,
    config::{Config, read_config_file},
    util::unix_now,
};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file; built-in defaults are used when omitted
    #[arg(short)]
    file: Option<String>,

    /// Run a single rollup pass and raw rotation, then exit
    #[arg(long)]
    once: bool,

    /// More output (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("watcher_metrics", level),
        ("watcher_rollup", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(file) => read_config_file(file)
            .with_context(|| format!("failed to load configuration from {file}"))?,
        None => Config::default(),
    };

    let tasks = build_collectors(&config);
    if tasks.is_empty() {
        warn!("no metric families enabled, nothing to do");
        return Ok(());
    }

    if args.once {
        let now = unix_now();
        let (reports, rotations) = tokio::task::spawn_blocking(move || {
            let reports: Vec<_> = tasks.iter().map(|t| t.process_rollup_at(now)).collect();
            let rotations: Vec<_> = tasks
                .iter()
                .map(|t| (t.name().to_string(), t.rotate_raw_at(now)))
                .collect();
            (reports, rotations)
        })
        .await?;

        let mut failed = 0;
        for report in &reports {
            for (tier, err) in report.failures() {
                warn!("{}/{}: {}", report.family, tier, err);
                failed += 1;
            }
            debug!(
                "{}: {} rollup entries written",
                report.family,
                report.flushed_entries()
            );
        }
        for (family, result) in rotations {
            match result {
                Ok(outcome) => debug!("{family}: {} raw entries purged", outcome.purged),
                Err(e) => {
                    warn!("{family}: rotation failed: {e}");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("{failed} rollup steps failed");
        }
        info!("single pass finished");
        return Ok(());
    }

    let handle = RollupHandle::spawn(
        tasks,
        Duration::from_secs(config.rollup_interval_secs.max(1)),
        Duration::from_secs(config.rotation_interval_secs.max(1)),
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping");

    if let Some(stats) = handle.get_stats().await {
        debug!(
            "{} passes, {} entries written, {} tier failures",
            stats.passes, stats.flushed_entries, stats.failed_tiers
        );
    }
    handle.shutdown().await;

    Ok(())
}
