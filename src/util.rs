use std::path::PathBuf;

use chrono::Utc;

const DATA_DIR: &str = "WATCHER_DATA_DIR";

const DEFAULT_DATA_DIR: &str = "/home/fpp/media/logs/watcher-data";

pub fn get_default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

pub fn get_data_dir() -> PathBuf {
    let dir_from_env = std::env::var(DATA_DIR);
    dir_from_env.map_or_else(|_| get_default_data_dir(), PathBuf::from)
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Round half away from zero to `places` decimal places.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}
