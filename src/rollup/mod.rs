//! Multi-resolution rollups
//!
//! Raw readings are summarised into fixed-width buckets per tier
//! (1min, 5min, 30min, 2hour). Each tier only ever emits a bucket once
//! it has fully elapsed and remembers its progress in a per-family
//! cursor document, so passes are idempotent and safe to repeat.
//!
//! ## Design
//!
//! - **Cascading**: the finest tier reads the raw log, every coarser
//!   tier reads the rollup file of the tier below it
//! - **Self-throttling**: a tier runs at most once per interval
//! - **Pluggable**: what a bucket turns into is decided by an
//!   [`Aggregator`] supplied by the metric family

pub mod aggregate;
pub mod processor;
pub mod state;
pub mod tier;

pub use aggregate::{AggregateStats, Aggregator, AverageMode, Reading, SampleAccumulator, SampleValue};
pub use processor::{RollupData, RollupProcessor, TierJob, TierOutcome};
pub use state::{RollupState, TierCursor};
pub use tier::{Tier, TierInfo, TierTable, format_duration, format_interval};
