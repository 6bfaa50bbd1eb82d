//! RollupActor - schedules rollup passes and raw log rotation
//!
//! ## Scheduling
//!
//! - **Rollup**: every `rollup_interval` all families run one pass over
//!   their tiers (each tier throttles itself to its own interval)
//! - **Rotation**: every `rotation_interval` the raw logs are trimmed to
//!   their retention
//!
//! File work is blocking, so every pass runs on the blocking pool. Passes
//! are strictly sequential: the actor awaits one before it looks at the
//! next tick or command.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use super::messages::{PassSummary, RollupCommand, RollupStats, RotationSummary};
use crate::collectors::RollupTask;
use crate::util::unix_now;

pub struct RollupActor {
    tasks: Vec<Arc<dyn RollupTask>>,

    command_rx: mpsc::Receiver<RollupCommand>,

    rollup_interval: Duration,

    rotation_interval: Duration,

    stats: RollupStats,
}

impl RollupActor {
    pub fn new(
        tasks: Vec<Arc<dyn RollupTask>>,
        command_rx: mpsc::Receiver<RollupCommand>,
        rollup_interval: Duration,
        rotation_interval: Duration,
    ) -> Self {
        Self {
            tasks,
            command_rx,
            rollup_interval,
            rotation_interval,
            stats: RollupStats::default(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(
            "starting rollup actor ({} families, rollup every {:?}, rotation every {:?})",
            self.tasks.len(),
            self.rollup_interval,
            self.rotation_interval
        );

        let mut rollup_interval = time::interval(self.rollup_interval);
        rollup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rotation_interval = time::interval(self.rotation_interval);
        rotation_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = rollup_interval.tick() => {
                    trace!("scheduled rollup pass");
                    if let Err(e) = self.run_pass().await {
                        warn!("rollup pass failed: {}", e);
                    }
                }

                _ = rotation_interval.tick() => {
                    trace!("scheduled raw log rotation");
                    if let Err(e) = self.rotate_all().await {
                        warn!("rotation failed: {}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        info!("rollup actor stopped after {} passes", self.stats.passes);
    }

    async fn run_pass(&mut self) -> anyhow::Result<PassSummary> {
        let tasks = self.tasks.clone();
        let now = unix_now();
        let reports = tokio::task::spawn_blocking(move || {
            tasks
                .iter()
                .map(|task| task.process_rollup_at(now))
                .collect::<Vec<_>>()
        })
        .await?;

        let mut summary = PassSummary {
            families: reports.len(),
            ..PassSummary::default()
        };
        for report in &reports {
            summary.flushed_entries += report.flushed_entries();
            for (tier, err) in report.failures() {
                warn!("{}/{}: {}", report.family, tier, err);
                summary.failed_tiers += 1;
            }
        }

        self.stats.passes += 1;
        self.stats.flushed_entries += summary.flushed_entries as u64;
        self.stats.failed_tiers += summary.failed_tiers as u64;
        self.stats.last_pass = Some(Utc::now());

        if summary.flushed_entries > 0 {
            debug!(
                "rollup pass #{}: {} entries written",
                self.stats.passes, summary.flushed_entries
            );
        }
        Ok(summary)
    }

    async fn rotate_all(&mut self) -> anyhow::Result<RotationSummary> {
        let tasks = self.tasks.clone();
        let now = unix_now();
        let results = tokio::task::spawn_blocking(move || {
            tasks
                .iter()
                .map(|task| (task.name().to_string(), task.rotate_raw_at(now)))
                .collect::<Vec<_>>()
        })
        .await?;

        let mut summary = RotationSummary {
            files: results.len(),
            ..RotationSummary::default()
        };
        for (family, result) in results {
            match result {
                Ok(outcome) => summary.purged += outcome.purged,
                Err(e) => {
                    warn!("failed to rotate raw log of {}: {}", family, e);
                    summary.failures += 1;
                }
            }
        }

        self.stats.rotations += 1;
        self.stats.purged_entries += summary.purged as u64;
        self.stats.last_rotation = Some(Utc::now());
        Ok(summary)
    }

    /// Handle a command, returns `false` when the actor should stop
    async fn handle_command(&mut self, cmd: RollupCommand) -> bool {
        match cmd {
            RollupCommand::RunNow { respond_to } => {
                debug!("manual rollup pass requested");
                let result = self.run_pass().await;
                let _ = respond_to.send(result);
            }
            RollupCommand::RotateNow { respond_to } => {
                debug!("manual rotation requested");
                let result = self.rotate_all().await;
                let _ = respond_to.send(result);
            }
            RollupCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats.clone());
            }
            RollupCommand::Shutdown => {
                info!("rollup actor shutting down");
                return false;
            }
        }
        true
    }
}

/// Handle for controlling the RollupActor
#[derive(Clone)]
pub struct RollupHandle {
    sender: mpsc::Sender<RollupCommand>,
}

impl RollupHandle {
    /// Spawn a new rollup actor over `tasks`
    pub fn spawn(
        tasks: Vec<Arc<dyn RollupTask>>,
        rollup_interval: Duration,
        rotation_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = RollupActor::new(tasks, cmd_rx, rollup_interval, rotation_interval);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a rollup pass now and wait for it
    pub async fn run_now(&self) -> anyhow::Result<PassSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RollupCommand::RunNow { respond_to: tx })
            .await?;

        rx.await?
    }

    /// Rotate all raw logs now and wait for it
    pub async fn rotate_now(&self) -> anyhow::Result<RotationSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RollupCommand::RotateNow { respond_to: tx })
            .await?;

        rx.await?
    }

    /// Get scheduler statistics
    pub async fn get_stats(&self) -> Option<RollupStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RollupCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Shutdown the rollup actor
    pub async fn shutdown(&self) {
        let _ = self.sender.send(RollupCommand::Shutdown).await;
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
