//! Append-only metric log files
//!
//! `MetricsStorage` is the only code that touches metric log files on
//! disk. Readers take a shared advisory lock, writers and rotation take
//! an exclusive one (via `fs2`), so cooperating processes never observe
//! half-written batches.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, trace, warn};

use super::error::{StorageError, StorageResult};
use super::line::{Timestamped, extract_timestamp, format_line, parse_line};

/// What a rotation pass did to a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotateOutcome {
    /// Entries dropped for being older than the retention cutoff
    pub purged: usize,
    /// Entries written back
    pub kept: usize,
}

impl RotateOutcome {
    pub fn rewrote(&self) -> bool {
        self.purged > 0
    }
}

/// Lock-guarded reads, appends and retention rotation for line logs
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsStorage;

impl MetricsStorage {
    pub fn new() -> Self {
        Self
    }

    /// Append a batch of entries under an exclusive lock.
    ///
    /// The whole batch is formatted before the file is touched and then
    /// written in one call, so a batch either lands completely or not at
    /// all (short of a crash mid-write). A file left ending in a partial
    /// line gets a newline first. Empty batches are a no-op.
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub fn append<T>(&self, path: &Path, entries: &[T]) -> StorageResult<()>
    where
        T: Serialize + Timestamped,
    {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buffer = String::new();
        for entry in entries {
            buffer.push_str(&format_line(entry)?);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        FileExt::lock_exclusive(&file).map_err(|e| StorageError::lock(path, e))?;

        let written = ends_mid_line(&mut file).and_then(|partial| {
            if partial {
                debug!("{} ends without a newline, starting a new line", path.display());
                buffer.insert(0, '\n');
            }
            file.write_all(buffer.as_bytes())?;
            file.flush()
        });
        let unlocked = FileExt::unlock(&file);
        written?;
        unlocked.map_err(|e| StorageError::lock(path, e))?;

        trace!("appended {} entries to {}", entries.len(), path.display());
        Ok(())
    }

    /// Read all entries with `timestamp > since`, sorted ascending.
    ///
    /// A missing file reads as empty. `since = 0` disables the filter.
    pub fn read<T>(&self, path: &Path, since: i64) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned + Timestamped,
    {
        match self.scan(path, since, |_| true) {
            Err(e) if e.is_not_found() => Ok(vec![]),
            other => other,
        }
    }

    /// Read entries with `timestamp > since` that also pass `keep`.
    ///
    /// Unlike [`MetricsStorage::read`] a missing file is reported as
    /// [`StorageError::NotFound`].
    #[instrument(skip(self, keep))]
    pub fn scan<T, F>(&self, path: &Path, since: i64, keep: F) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned + Timestamped,
        F: Fn(&T) -> bool,
    {
        let contents = match read_locked(path) {
            Err(e) if e.is_not_found() => return Err(StorageError::NotFound(path.to_path_buf())),
            other => other?,
        };

        let mut skipped = 0usize;
        let mut entries = Vec::new();
        for line in contents.lines() {
            if since > 0 {
                match extract_timestamp(line) {
                    Some(ts) if ts > since => {}
                    Some(_) => continue,
                    None => {
                        skipped += 1;
                        continue;
                    }
                }
            }
            match parse_line::<T>(line) {
                Some(entry) if entry.timestamp() > since && keep(&entry) => entries.push(entry),
                Some(_) => {}
                None if line.trim().is_empty() => {}
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!("skipped {} unparsable lines in {}", skipped, path.display());
        }

        entries.sort_by_key(|e| e.timestamp());
        Ok(entries)
    }

    /// Drop entries older than `retention_secs`, using the wall clock
    pub fn rotate(&self, path: &Path, retention_secs: i64) -> StorageResult<RotateOutcome> {
        self.rotate_at(path, retention_secs, crate::util::unix_now())
    }

    /// Drop entries with `timestamp < now - retention_secs`.
    ///
    /// Survivors keep their original bytes. When something was purged
    /// the file is replaced atomically: survivors go to `<file>.tmp`,
    /// the previous backup is removed, the current contents are linked
    /// (or copied) to `<file>.old` and the temp file is renamed over the
    /// file. Readers see either the old or the new contents, never a
    /// missing file. Nothing is rewritten when no entry is old enough.
    #[instrument(skip(self))]
    pub fn rotate_at(
        &self,
        path: &Path,
        retention_secs: i64,
        now: i64,
    ) -> StorageResult<RotateOutcome> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RotateOutcome::default()),
            Err(e) => return Err(e.into()),
        };
        FileExt::lock_exclusive(&file).map_err(|e| StorageError::lock(path, e))?;

        let result = rewrite_without_expired(&mut file, path, now - retention_secs);
        let unlocked = FileExt::unlock(&file);
        let outcome = result?;
        unlocked.map_err(|e| StorageError::lock(path, e))?;

        if outcome.rewrote() {
            info!(
                "rotated {}: purged {} entries, kept {}",
                path.display(),
                outcome.purged,
                outcome.kept
            );
        }
        Ok(outcome)
    }
}

fn rewrite_without_expired(
    file: &mut File,
    path: &Path,
    cutoff: i64,
) -> StorageResult<RotateOutcome> {
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let mut outcome = RotateOutcome::default();
    let mut survivors: Vec<u8> = Vec::with_capacity(contents.len());
    for raw in contents.split_inclusive(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(raw);
        match extract_timestamp(&line) {
            Some(ts) if ts < cutoff => outcome.purged += 1,
            Some(_) => {
                outcome.kept += 1;
                survivors.extend_from_slice(raw);
                if !raw.ends_with(b"\n") {
                    survivors.push(b'\n');
                }
            }
            None => {}
        }
    }

    if outcome.purged == 0 {
        return Ok(outcome);
    }

    let tmp = sibling(path, ".tmp");
    let old = sibling(path, ".old");

    fs::write(&tmp, &survivors)?;
    if let Err(e) = fs::remove_file(&old)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("could not remove stale backup {}: {}", old.display(), e);
    }
    // `path` must exist at every instant, so the backup is a second link
    // and the survivors replace the file in a single rename
    if let Err(e) = fs::hard_link(path, &old) {
        trace!("hard link to {} failed ({}), copying", old.display(), e);
        fs::copy(path, &old)?;
    }
    fs::rename(&tmp, path)?;

    Ok(outcome)
}

fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_locked(path: &Path) -> StorageResult<String> {
    let mut file = File::open(path)?;
    FileExt::lock_shared(&file).map_err(|e| StorageError::lock(path, e))?;

    let mut bytes = Vec::new();
    let read = file.read_to_end(&mut bytes);
    let unlocked = FileExt::unlock(&file);
    read?;
    unlocked.map_err(|e| StorageError::lock(path, e))?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// `path` with `suffix` appended to its file name (`a.log` -> `a.log.old`)
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
