//! Core data models for tollgate.
//!
//! - `item`: work items and their ordered source
//! - `record`: checkpoint records and interpreted results
//! - `config`: TOML configuration
//! - `error`: error taxonomy

mod config;
mod error;
mod item;
mod record;

pub use config::*;
pub use error::*;
pub use item::*;
pub use record::*;
