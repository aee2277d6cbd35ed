//! Append-only checkpoint log.
//!
//! One JSON record per line. Reconstruction scans the file in order and lets
//! later records replace earlier ones with the same id, so the authoritative
//! state of an item is always its last appended record. Lines that do not
//! parse (a write torn by a crash) are counted and skipped.
//!
//! The log is never compacted. A forced fresh run renames the old file aside
//! instead of deleting it.

use crate::budget::BudgetState;
use crate::models::{CheckpointRecord, Result, TollgateError};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Last-write-wins view over a checkpoint log.
#[derive(Debug, Clone, Default)]
pub struct CheckpointIndex {
    latest: HashMap<String, CheckpointRecord>,
    total_records: usize,
    skipped_lines: usize,
    spend: BudgetState,
    run_ids: BTreeSet<String>,
}

impl CheckpointIndex {
    /// Rebuild an index from raw log bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut index = Self::default();
        for line in bytes.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<CheckpointRecord>(line) {
                Ok(record) => index.apply(record),
                Err(e) => {
                    index.skipped_lines += 1;
                    debug!(error = %e, bytes = line.len(), "Skipping unparseable checkpoint line");
                }
            }
        }
        index
    }

    /// Fold one record into the index.
    pub fn apply(&mut self, record: CheckpointRecord) {
        self.total_records += 1;
        self.spend.requests += u64::from(record.attempts);
        if let Some(usage) = record.usage {
            self.spend.input_tokens += usage.input_tokens;
            self.spend.output_tokens += usage.output_tokens;
        }
        self.spend.cost_usd += record.cost_usd;
        self.run_ids.insert(record.run_id.clone());
        self.latest.insert(record.id.clone(), record);
    }

    /// Authoritative record for an item.
    pub fn latest(&self, id: &str) -> Option<&CheckpointRecord> {
        self.latest.get(id)
    }

    /// All authoritative records keyed by item id.
    pub fn records(&self) -> &HashMap<String, CheckpointRecord> {
        &self.latest
    }

    /// Number of distinct item ids with at least one record.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Records read or appended, superseded ones included.
    pub fn total_records(&self) -> usize {
        self.total_records
    }

    /// Lines that failed to parse.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Spend accumulated over every record in the log.
    pub fn spend(&self) -> &BudgetState {
        &self.spend
    }

    /// Run ids that wrote to this log.
    pub fn run_ids(&self) -> &BTreeSet<String> {
        &self.run_ids
    }
}

/// Single-writer append handle on a checkpoint file.
pub struct CheckpointLog {
    path: PathBuf,
    writer: BufWriter<File>,
    index: CheckpointIndex,
    flush_every: usize,
    fsync: bool,
    unflushed: usize,
}

impl CheckpointLog {
    /// Open (or create) a log, reconstructing its index.
    ///
    /// `flush_every` sets the durability cadence: the writer is flushed after
    /// every N appends. With `fsync`, each flush also syncs file data.
    pub fn open(path: &Path, flush_every: usize, fsync: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| TollgateError::io("creating checkpoint dir", e))?;
        }

        let bytes = read_if_exists(path)?;
        let index = CheckpointIndex::from_bytes(&bytes);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TollgateError::io("opening checkpoint log", e))?;
        let mut writer = BufWriter::new(file);

        // A torn final line must not swallow the next record.
        if bytes.last().is_some_and(|b| *b != b'\n') {
            warn!(path = %path.display(), "Checkpoint ends with a partial line, starting a fresh line");
            writer
                .write_all(b"\n")
                .map_err(|e| TollgateError::io("repairing checkpoint tail", e))?;
            writer
                .flush()
                .map_err(|e| TollgateError::io("repairing checkpoint tail", e))?;
        }

        if index.skipped_lines() > 0 {
            warn!(
                skipped = index.skipped_lines(),
                "Ignored unparseable checkpoint lines"
            );
        }
        info!(
            path = %path.display(),
            records = index.total_records(),
            items = index.len(),
            "Checkpoint opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            index,
            flush_every: flush_every.max(1),
            fsync,
            unflushed: 0,
        })
    }

    /// Read a log without opening it for writing. A missing file is empty.
    pub fn load(path: &Path) -> Result<CheckpointIndex> {
        let bytes = read_if_exists(path)?;
        Ok(CheckpointIndex::from_bytes(&bytes))
    }

    /// Whether a log exists and holds anything at all.
    pub fn has_content(path: &Path) -> bool {
        fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
    }

    /// Move an existing log aside so a fresh run can start.
    ///
    /// Returns the new location, or `None` when there was nothing to move.
    pub fn supersede(path: &Path) -> Result<Option<PathBuf>> {
        if !path.exists() {
            return Ok(None);
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let target = path.with_file_name(format!("{file_name}.superseded-{stamp}"));

        fs::rename(path, &target).map_err(|e| TollgateError::io("superseding checkpoint", e))?;
        info!(from = %path.display(), to = %target.display(), "Superseded previous checkpoint");
        Ok(Some(target))
    }

    /// Append one record.
    ///
    /// The record is visible through `index()` immediately; it reaches the
    /// file according to the flush cadence.
    pub fn append(&mut self, record: CheckpointRecord) -> Result<()> {
        let line = serde_json::to_string(&record)
            .map_err(|e| TollgateError::Internal(format!("Serializing checkpoint record: {e}")))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| TollgateError::io("appending checkpoint record", e))?;

        debug!(id = %record.id, status = %record.status, "Checkpoint record appended");
        self.index.apply(record);

        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Push buffered records to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| TollgateError::io("flushing checkpoint", e))?;
        if self.fsync {
            self.writer
                .get_ref()
                .sync_data()
                .map_err(|e| TollgateError::io("syncing checkpoint", e))?;
        }
        self.unflushed = 0;
        Ok(())
    }

    /// Current last-write-wins view, including unflushed appends.
    pub fn index(&self) -> &CheckpointIndex {
        &self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CheckpointLog {
    fn drop(&mut self) {
        if self.unflushed > 0 {
            if let Err(e) = self.writer.flush() {
                warn!(error = %e, pending = self.unflushed, "Failed to flush checkpoint on drop");
            }
        }
    }
}

fn read_if_exists(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)
                .map_err(|e| TollgateError::io("reading checkpoint log", e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(TollgateError::io("opening checkpoint log", e)),
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutcomeStatus, SkipReason, Usage};
    use tempfile::TempDir;

    fn failed(id: &str, cost: f64) -> CheckpointRecord {
        CheckpointRecord::failed(id, "run-1", "boom".into(), Some(Usage::new(10, 0)), cost, 2)
    }

    #[test]
    fn test_last_write_wins_by_append_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");

        {
            let mut log = CheckpointLog::open(&path, 1, false).unwrap();
            log.append(failed("a", 0.5)).unwrap();
            log.append(CheckpointRecord::skipped("b", "run-1", SkipReason::Budget))
                .unwrap();
            log.append(CheckpointRecord::skipped("a", "run-1", SkipReason::Oversize))
                .unwrap();
        }

        let index = CheckpointLog::load(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_records(), 3);
        let a = index.latest("a").unwrap();
        assert_eq!(a.status, OutcomeStatus::Skipped);
        assert_eq!(a.skip_reason, Some(SkipReason::Oversize));
        // Superseded records still count toward spend.
        assert!((index.spend().cost_usd - 0.5).abs() < 1e-9);
        assert_eq!(index.spend().requests, 2);
    }

    #[test]
    fn test_truncated_trailing_line_is_skipped_and_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");

        let good = serde_json::to_string(&failed("a", 0.1)).unwrap();
        let torn = &serde_json::to_string(&failed("b", 0.1)).unwrap()[..20];
        fs::write(&path, format!("{good}\n{torn}")).unwrap();

        let index = CheckpointLog::load(&path).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.skipped_lines(), 1);

        {
            let mut log = CheckpointLog::open(&path, 1, false).unwrap();
            log.append(failed("c", 0.1)).unwrap();
        }

        let index = CheckpointLog::load(&path).unwrap();
        assert!(index.latest("a").is_some());
        assert!(index.latest("c").is_some());
        assert!(index.latest("b").is_none());
        assert_eq!(index.skipped_lines(), 1);
    }

    #[test]
    fn test_invalid_utf8_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let good = serde_json::to_string(&failed("a", 0.1)).unwrap();
        let mut bytes = format!("{good}\n").into_bytes();
        bytes.extend_from_slice(&[b'{', 0xE2, 0x82]);
        fs::write(&path, bytes).unwrap();

        let index = CheckpointLog::load(&path).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.skipped_lines(), 1);
    }

    #[test]
    fn test_appends_visible_before_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");

        let mut log = CheckpointLog::open(&path, 3, false).unwrap();
        log.append(failed("a", 0.0)).unwrap();
        log.append(failed("b", 0.0)).unwrap();

        assert!(log.index().latest("b").is_some());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        log.append(failed("c", 0.0)).unwrap();
        assert_eq!(CheckpointLog::load(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_supersede_keeps_old_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let mut log = CheckpointLog::open(&path, 1, true).unwrap();
            log.append(failed("a", 0.0)).unwrap();
        }
        assert!(CheckpointLog::has_content(&path));

        let moved = CheckpointLog::supersede(&path).unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(CheckpointLog::load(&moved).unwrap().len(), 1);
        assert!(CheckpointLog::supersede(&path).unwrap().is_none());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let index = CheckpointLog::load(&dir.path().join("absent.jsonl")).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.total_records(), 0);
    }
}
