//! Rollup tier definitions
//!
//! A tier is a fixed-width bucket interval with its own retention. The
//! standard ladder is 1min / 5min / 30min / 2hour; collectors with a
//! shorter retention use a capped or retention-derived subset.

use std::path::PathBuf;

use serde::Serialize;

const MINUTE: i64 = 60;
const HOUR: i64 = 3600;
const DAY: i64 = 86_400;

/// One rollup granularity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tier {
    /// Stable name, also the rollup file stem and cursor key
    pub name: String,
    /// Bucket width in seconds
    pub interval: i64,
    /// How long entries of this tier are kept, in seconds
    pub retention: i64,
    /// Human readable label
    pub label: String,
}

impl Tier {
    pub fn new(name: &str, interval: i64, retention: i64, label: &str) -> Self {
        Self {
            name: name.to_string(),
            interval,
            retention,
            label: label.to_string(),
        }
    }

    /// Start of the bucket containing `timestamp`
    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.interval) * self.interval
    }

    pub fn retention_hours(&self) -> i64 {
        self.retention / HOUR
    }

    /// Rollup log file name for this tier (`1min.log`)
    pub fn file_name(&self) -> String {
        format!("{}.log", self.name)
    }
}

/// Ordered list of tiers, finest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    /// Build a table from arbitrary tiers, sorted finest first
    pub fn new(mut tiers: Vec<Tier>) -> Self {
        tiers.sort_by_key(|t| t.interval);
        Self { tiers }
    }

    /// The full 4-tier ladder
    pub fn standard() -> Self {
        Self::new(vec![
            Tier::new("1min", MINUTE, 6 * HOUR, "1-minute averages"),
            Tier::new("5min", 5 * MINUTE, 48 * HOUR, "5-minute averages"),
            Tier::new("30min", 30 * MINUTE, 14 * DAY, "30-minute averages"),
            Tier::new("2hour", 2 * HOUR, 90 * DAY, "2-hour averages"),
        ])
    }

    /// Standard ladder capped at `max_days`; the coarsest tier keeps
    /// exactly `max_days`
    pub fn capped(max_days: i64) -> Self {
        let cap = max_days.max(1) * DAY;
        let mut tiers = Self::standard().tiers;
        let last = tiers.len() - 1;
        for (i, tier) in tiers.iter_mut().enumerate() {
            tier.retention = if i == last { cap } else { tier.retention.min(cap) };
        }
        Self::new(tiers)
    }

    /// Only the tiers a retention of `retention_days` actually needs.
    ///
    /// 1min is always present, 5min above one day, 30min above three
    /// and 2hour above seven. Retentions are capped at the configured
    /// value and the 2hour tier keeps all of it.
    pub fn by_retention(retention_days: i64) -> Self {
        let days = retention_days.max(1);
        let cap = days * DAY;
        let mut tiers = vec![Tier::new("1min", MINUTE, (6 * HOUR).min(cap), "1-minute averages")];
        if days > 1 {
            tiers.push(Tier::new(
                "5min",
                5 * MINUTE,
                (48 * HOUR).min(cap),
                "5-minute averages",
            ));
        }
        if days > 3 {
            tiers.push(Tier::new(
                "30min",
                30 * MINUTE,
                (7 * DAY).min(cap),
                "30-minute averages",
            ));
        }
        if days > 7 {
            tiers.push(Tier::new("2hour", 2 * HOUR, cap, "2-hour averages"));
        }
        Self::new(tiers)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// The next finer tier, which feeds `name` during cascading
    pub fn previous(&self, name: &str) -> Option<&Tier> {
        let idx = self.tiers.iter().position(|t| t.name == name)?;
        idx.checked_sub(1).map(|i| &self.tiers[i])
    }

    pub fn finest(&self) -> Option<&Tier> {
        self.tiers.first()
    }

    pub fn coarsest(&self) -> Option<&Tier> {
        self.tiers.last()
    }

    /// Finest tier whose retention still covers `hours` of history,
    /// falling back to the coarsest tier.
    pub fn best_tier_for_hours(&self, hours: i64) -> Option<&Tier> {
        self.tiers
            .iter()
            .find(|t| hours <= t.retention_hours())
            .or_else(|| self.coarsest())
    }

    /// Same as [`TierTable::best_tier_for_hours`] restricted to tiers
    /// that pass `available`, used to fall back to finer tiers whose
    /// files exist.
    pub fn best_available_tier<F>(&self, hours: i64, available: F) -> Option<&Tier>
    where
        F: Fn(&Tier) -> bool,
    {
        let best = self.best_tier_for_hours(hours)?;
        if available(best) {
            return Some(best);
        }
        let idx = self.tiers.iter().position(|t| t.name == best.name)?;
        self.tiers[..idx].iter().rev().find(|t| available(t))
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Display view of a tier and its rollup file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierInfo {
    pub name: String,
    pub interval: i64,
    pub interval_label: String,
    pub retention: i64,
    pub retention_label: String,
    pub label: String,
    pub file: PathBuf,
    pub file_exists: bool,
    pub file_size: u64,
}

/// "60 seconds" style label for a bucket width
pub fn format_interval(seconds: i64) -> String {
    if seconds < MINUTE {
        format!("{} seconds", seconds)
    } else if seconds < HOUR {
        format!("{} minutes", seconds / MINUTE)
    } else {
        format!("{} hours", seconds / HOUR)
    }
}

/// "6 hours" / "14 days" style label for a retention
pub fn format_duration(seconds: i64) -> String {
    if seconds < HOUR {
        format!("{} minutes", seconds / MINUTE)
    } else if seconds < DAY {
        format!("{} hours", seconds / HOUR)
    } else {
        format!("{} days", seconds / DAY)
    }
}
