//! Background rollup scheduling
//!
//! A single actor owns the schedule. It runs as an async task and is
//! controlled through a [`rollup::RollupHandle`]:
//!
//! ```text
//!   RollupHandle ──mpsc──▶ RollupActor ──spawn_blocking──▶ RollupTask (per family)
//!        ▲                     │
//!        └──────oneshot────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: the actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for answers (pass summaries, stats)

pub mod messages;
pub mod rollup;
