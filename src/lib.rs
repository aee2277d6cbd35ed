//! tollgate - resumable, budget-gated batch processing through LLM endpoints.
//!
//! ## Architecture
//!
//! A run drives an ordered `ItemSource` through one provider, one item at a
//! time:
//! - **CheckpointLog**: append-only JSONL of every attempt; last write wins
//! - **BudgetTracker**: pre-call estimate gate against a spend ceiling
//! - **ProviderAdapter**: credential rotation, 429/5xx backoff, bounded attempts
//! - **ResponseInterpreter**: strict JSON parse with salvage of truncated replies
//! - **RunController**: the state machine tying the above together
//! - **SnapshotWriter**: ordered, complete output rendered from the checkpoint
//!
//! ## Resume
//!
//! Every attempt is appended before the next item starts, so a killed run loses
//! at most the item in flight. Resuming skips items whose last record is a
//! success; budget and size skips are always picked up again, failures only on
//! request.

pub mod budget;
pub mod checkpoint;
pub mod client;
pub mod interpret;
pub mod models;
pub mod pipeline;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use budget::{BudgetState, BudgetTracker};
pub use checkpoint::{CheckpointIndex, CheckpointLog};
pub use client::{CredentialPool, HttpTransport, ProviderAdapter, RetryPolicy, Transport};
pub use interpret::{ResponseInterpreter, ResponseSchema};
pub use models::{Config, Item, ItemResult, ItemSource, Result, TollgateError};
pub use pipeline::{
    ItemProcessor, RunController, RunReport, RunSnapshot, SnapshotMeta, SnapshotWriter,
    TemplateProcessor,
};
