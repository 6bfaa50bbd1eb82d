//! File storage for metric logs
//!
//! Every metric family persists to plain append-only text files, one
//! JSON entry per line. This module owns the line format, the advisory
//! locking and the retention rotation of those files.
//!
//! ## Design
//!
//! - **Append-only**: entries are only ever appended; old ones disappear
//!   through rotation, which rewrites the file atomically
//! - **Lock-guarded**: shared locks for readers, exclusive for writers
//! - **Tolerant reads**: unparsable or truncated lines are skipped
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use watcher_metrics::storage::MetricsStorage;
//! use watcher_metrics::collectors::ping::PingSample;
//!
//! fn main() -> anyhow::Result<()> {
//!     let storage = MetricsStorage::new();
//!     let raw: Vec<PingSample> = storage.read(Path::new("/tmp/ping/raw.log"), 0)?;
//!     storage.rotate(Path::new("/tmp/ping/raw.log"), 25 * 3600)?;
//!     println!("{} samples", raw.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod file;
pub mod line;

pub use error::{StorageError, StorageResult};
pub use file::{MetricsStorage, RotateOutcome};
pub use line::Timestamped;
