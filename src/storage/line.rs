//! Line format for metric logs
//!
//! Every entry is one line: a bracketed local-time stamp for humans,
//! one space, then the JSON object.
//!
//! ```text
//! [2025-01-15 10:30:00] {"timestamp":1736937000,"host":"8.8.8.8","latency":12.3}
//! ```
//!
//! Readers only trust the JSON `timestamp` field. Bare JSON lines (no
//! prefix) are accepted as well, which is how some older files were
//! written.

use std::sync::LazyLock;

use chrono::{Local, TimeZone};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::StorageResult;

/// Anything that carries the unix-seconds timestamp stored in its JSON
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

static TIMESTAMP_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""timestamp"\s*:\s*(\d+)"#).expect("timestamp pattern is valid")
});

/// Render one entry as a log line, including the trailing newline
pub fn format_line<T: Serialize + Timestamped>(entry: &T) -> StorageResult<String> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("[{}] {}\n", human_time(entry.timestamp()), json))
}

/// Parse a log line back into an entry.
///
/// Returns `None` for blank, truncated or otherwise unparsable lines.
pub fn parse_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let json = json_part(line)?;
    serde_json::from_str(json).ok()
}

/// Cheap timestamp extraction without a full JSON parse
pub fn extract_timestamp(line: &str) -> Option<i64> {
    TIMESTAMP_FIELD
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn json_part(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('{') {
        return Some(line);
    }
    // "[YYYY-MM-DD HH:MM:SS] {...}"
    let (_, rest) = line.split_once("] ")?;
    let rest = rest.trim_start();
    rest.starts_with('{').then_some(rest)
}

fn human_time(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "0000-00-00 00:00:00".to_string(),
    }
}
