//! Message types for actor communication
//!
//! Commands are sent to the rollup actor through an mpsc channel; every
//! command that expects an answer carries a oneshot sender.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

/// Commands that can be sent to the RollupActor
#[derive(Debug)]
pub enum RollupCommand {
    /// Run a rollup pass over every family right away
    ///
    /// Tiers still throttle themselves, so a pass shortly after the
    /// scheduled one may find nothing to do.
    RunNow {
        respond_to: oneshot::Sender<anyhow::Result<PassSummary>>,
    },

    /// Rotate every raw log right away
    RotateNow {
        respond_to: oneshot::Sender<anyhow::Result<RotationSummary>>,
    },

    /// Get scheduler statistics
    GetStats {
        respond_to: oneshot::Sender<RollupStats>,
    },

    /// Gracefully shut down the actor
    ///
    /// A pass in flight finishes first.
    Shutdown,
}

/// Result of one rollup pass over all families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub families: usize,
    pub flushed_entries: usize,
    pub failed_tiers: usize,
}

/// Result of one raw log rotation over all families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub files: usize,
    pub purged: usize,
    pub failures: usize,
}

/// Rollup scheduler statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollupStats {
    /// Completed rollup passes
    pub passes: u64,

    /// Completed rotation runs
    pub rotations: u64,

    /// Rollup entries written since start
    pub flushed_entries: u64,

    /// Tier passes that failed since start
    pub failed_tiers: u64,

    /// Raw entries purged by rotation since start
    pub purged_entries: u64,

    pub last_pass: Option<DateTime<Utc>>,

    pub last_rotation: Option<DateTime<Utc>>,
}
