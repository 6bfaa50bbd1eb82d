pub mod actors;
pub mod collectors;
pub mod config;
pub mod quality;
pub mod rollup;
pub mod storage;
pub mod util;
