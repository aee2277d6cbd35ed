//! Ordered run snapshot rendered from the item source and the checkpoint.
//!
//! Rendering is pure: the same source and log always give the same document,
//! so a snapshot can be regenerated at any time without touching a provider.

use crate::budget::BudgetState;
use crate::checkpoint::CheckpointIndex;
use crate::models::{
    CheckpointRecord, Config, ItemSource, OutcomeStatus, Result, SkipReason, StructuredResult,
    TollgateError,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Per-item status in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Success,
    Salvaged,
    Failed,
    Skipped,
    /// No record exists for this item
    Missing,
}

impl From<OutcomeStatus> for EntryStatus {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Success => EntryStatus::Success,
            OutcomeStatus::Salvaged => EntryStatus::Salvaged,
            OutcomeStatus::Failed => EntryStatus::Failed,
            OutcomeStatus::Skipped => EntryStatus::Skipped,
        }
    }
}

/// One item's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub index: usize,
    pub status: EntryStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StructuredResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,

    #[serde(default)]
    pub needs_review: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    #[serde(default)]
    pub cost_usd: f64,
}

impl SnapshotEntry {
    fn from_record(id: &str, index: usize, record: &CheckpointRecord) -> Self {
        Self {
            id: id.to_string(),
            index,
            status: record.status.into(),
            result: record.result.clone(),
            missing_fields: record.missing_fields.clone(),
            needs_review: record.needs_review,
            error: record.error.clone(),
            skip_reason: record.skip_reason,
            cost_usd: record.cost_usd,
        }
    }

    fn missing(id: &str, index: usize) -> Self {
        Self {
            id: id.to_string(),
            index,
            status: EntryStatus::Missing,
            result: None,
            missing_fields: Vec::new(),
            needs_review: false,
            error: None,
            skip_reason: None,
            cost_usd: 0.0,
        }
    }
}

/// Aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTotals {
    pub items: usize,
    pub success: usize,
    pub salvaged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub missing: usize,
    pub needs_review: usize,
    /// Cost of the authoritative records
    pub cost_usd: f64,
    /// Everything the checkpoint has recorded, superseded attempts included
    pub spend: BudgetState,
}

/// Identifiers carried in the snapshot header.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub run_id: String,
    pub provider: String,
    pub model: String,
}

impl SnapshotMeta {
    /// Header for a snapshot rendered outside a run.
    ///
    /// Uses the configured run id, else every run id found in the log.
    pub fn for_checkpoint(config: &Config, index: &CheckpointIndex) -> Self {
        let run_id = config.run.run_id.clone().unwrap_or_else(|| {
            index
                .run_ids()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        });
        Self {
            run_id,
            provider: config.provider.name.clone(),
            model: config.provider.model.clone(),
        }
    }
}

/// Final, order-complete output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub provider: String,
    pub model: String,
    pub totals: SnapshotTotals,
    pub entries: Vec<SnapshotEntry>,
}

/// Renders and persists snapshots.
pub struct SnapshotWriter;

impl SnapshotWriter {
    /// Render one entry per source item, in source order.
    pub fn render(source: &ItemSource, index: &CheckpointIndex, meta: &SnapshotMeta) -> RunSnapshot {
        let mut totals = SnapshotTotals {
            items: source.len(),
            spend: index.spend().clone(),
            ..Default::default()
        };

        let entries: Vec<SnapshotEntry> = source
            .iter()
            .map(|item| match index.latest(&item.id) {
                Some(record) => SnapshotEntry::from_record(&item.id, item.index, record),
                None => SnapshotEntry::missing(&item.id, item.index),
            })
            .collect();

        for entry in &entries {
            match entry.status {
                EntryStatus::Success => totals.success += 1,
                EntryStatus::Salvaged => totals.salvaged += 1,
                EntryStatus::Failed => totals.failed += 1,
                EntryStatus::Skipped => totals.skipped += 1,
                EntryStatus::Missing => totals.missing += 1,
            }
            if entry.needs_review {
                totals.needs_review += 1;
            }
            totals.cost_usd += entry.cost_usd;
        }

        RunSnapshot {
            run_id: meta.run_id.clone(),
            provider: meta.provider.clone(),
            model: meta.model.clone(),
            totals,
            entries,
        }
    }

    /// Write pretty JSON via a temp file and rename.
    pub fn write(snapshot: &RunSnapshot, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TollgateError::io("creating output dir", e))?;
        }

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = Path::new(&temp_name);

        let file =
            File::create(temp_path).map_err(|e| TollgateError::io("creating temp snapshot", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot)
            .map_err(|e| TollgateError::Internal(format!("Serializing snapshot: {e}")))?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| TollgateError::io("writing snapshot", e))?;
        drop(writer);

        fs::rename(temp_path, path).map_err(|e| TollgateError::io("renaming snapshot", e))?;

        info!(
            path = %path.display(),
            items = snapshot.totals.items,
            missing = snapshot.totals.missing,
            "Snapshot written"
        );
        Ok(())
    }
}
