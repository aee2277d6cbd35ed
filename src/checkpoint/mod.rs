//! Checkpoint module for resumable runs.
//!
//! Provides:
//! - `CheckpointLog`: single-writer, append-only JSONL log of attempt outcomes
//! - `CheckpointIndex`: last-write-wins reconstruction of that log

mod log;

pub use log::*;
