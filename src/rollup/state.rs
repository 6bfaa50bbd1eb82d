//! Per-tier rollup cursors
//!
//! Each metric family keeps one small JSON document keyed by tier name.
//! A cursor remembers what has already been rolled up so repeated passes
//! never emit a bucket twice.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tier::TierTable;
use crate::storage::{StorageError, StorageResult};

/// Progress of one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCursor {
    /// Entries at or before this timestamp have been consumed
    #[serde(default)]
    pub last_processed: i64,
    /// End of the newest bucket emitted; later buckets must end after it
    #[serde(default)]
    pub last_bucket_end: i64,
    /// Wall-clock time of the last pass over this tier
    #[serde(default)]
    pub last_rollup: i64,
}

/// Cursor document for one family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollupState {
    tiers: BTreeMap<String, TierCursor>,
}

impl RollupState {
    /// All-zero cursors for every tier in `table`
    pub fn fresh(table: &TierTable) -> Self {
        let mut state = Self::default();
        state.backfill(table);
        state
    }

    /// Add zero cursors for tiers the document does not know about yet
    pub fn backfill(&mut self, table: &TierTable) {
        for tier in table.iter() {
            self.tiers.entry(tier.name.clone()).or_default();
        }
    }

    /// Cursor for `tier`, zero if unknown
    pub fn cursor(&self, tier: &str) -> TierCursor {
        self.tiers.get(tier).copied().unwrap_or_default()
    }

    pub fn set_cursor(&mut self, tier: &str, cursor: TierCursor) {
        self.tiers.insert(tier.to_string(), cursor);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TierCursor)> {
        self.tiers.iter().map(|(name, cursor)| (name.as_str(), cursor))
    }
}

/// Load the cursor document at `path`.
///
/// A missing file yields fresh cursors. An unreadable or corrupt
/// document is logged and replaced by fresh cursors, which makes the
/// next pass reprocess whatever source data still exists.
pub fn load_state(path: &Path, table: &TierTable) -> StorageResult<RollupState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("no rollup state at {}, starting fresh", path.display());
            return Ok(RollupState::fresh(table));
        }
        Err(e) => return Err(e.into()),
    };

    let mut state = match parse_state(&contents) {
        Ok(state) => state,
        Err(e) => {
            warn!("{} in {}, rebuilding", e, path.display());
            return Ok(RollupState::fresh(table));
        }
    };
    state.backfill(table);
    Ok(state)
}

fn parse_state(contents: &str) -> StorageResult<RollupState> {
    if contents.trim().is_empty() {
        return Err(StorageError::CorruptState("empty document".to_string()));
    }
    serde_json::from_str(contents).map_err(|e| StorageError::CorruptState(e.to_string()))
}

/// Persist `state` as pretty JSON under an exclusive lock
pub fn save_state(path: &Path, state: &RollupState) -> StorageResult<()> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    state.serialize(&mut serializer)?;
    buffer.push(b'\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    FileExt::lock_exclusive(&file).map_err(|e| StorageError::lock(path, e))?;

    let written = file
        .set_len(0)
        .and_then(|_| file.write_all(&buffer))
        .and_then(|_| file.sync_data());
    let unlocked = FileExt::unlock(&file);
    written?;
    unlocked.map_err(|e| StorageError::lock(path, e))?;
    Ok(())
}
