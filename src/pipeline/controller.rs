//! Run controller: the resumable, budget-gated main loop.
//!
//! Flow:
//! Init → LoadingCheckpoint → Iterating → (BudgetCheck → Calling →
//! Interpreting → Recording)* → Finalizing → Done
//!
//! Setup failures end in `Fatal` before any item is touched. Everything that
//! goes wrong with a single item becomes a checkpoint record instead.

use super::{ItemProcessor, SnapshotMeta, SnapshotTotals, SnapshotWriter, TemplateProcessor};
use crate::budget::{BudgetState, BudgetTracker};
use crate::checkpoint::{CheckpointIndex, CheckpointLog};
use crate::client::{CredentialPool, HttpTransport, ProviderAdapter, ProviderStats, RetryPolicy};
use crate::interpret::ResponseInterpreter;
use crate::models::{
    expand_headers, CheckpointRecord, Config, Item, ItemSource, OutcomeStatus, Result, SkipReason,
    TollgateError,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    LoadingCheckpoint,
    Iterating,
    BudgetCheck,
    Calling,
    Interpreting,
    Recording,
    Finalizing,
    Done,
    Fatal,
}

/// Per-run item counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounts {
    /// Items sent to the provider
    pub attempted: usize,
    pub succeeded: usize,
    pub salvaged: usize,
    pub failed: usize,
    pub skipped_oversize: usize,
    pub skipped_budget: usize,
    /// Items already successful in the checkpoint
    pub already_done: usize,
    /// Failed or salvaged items left alone because retry_failed is off
    pub held_back: usize,
    /// Eligible items beyond the per-run limit
    pub beyond_limit: usize,
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub resumed: bool,
    pub counts: RunCounts,
    pub budget_stop: bool,
    pub limit_stop: bool,
    /// Spend including earlier runs when resumed
    pub spend: BudgetState,
    pub totals: SnapshotTotals,
    pub provider: ProviderStats,
    pub snapshot_path: PathBuf,
    pub runtime_secs: f64,
}

/// Mutable state for a single pass over the items.
struct RunPass {
    run_id: String,
    log: CheckpointLog,
    budget: BudgetTracker,
    counts: RunCounts,
    calls_made: usize,
}

enum ItemStep {
    Continue,
    BudgetStop,
}

/// Drives items through request building, the provider and the interpreter,
/// recording every attempt.
pub struct RunController {
    config: Config,
    processor: Box<dyn ItemProcessor>,
    provider: ProviderAdapter,
    interpreter: ResponseInterpreter,
    state: RunState,
}

impl RunController {
    pub fn new(config: Config, processor: Box<dyn ItemProcessor>, provider: ProviderAdapter) -> Self {
        let interpreter = ResponseInterpreter::new(config.schema.clone());
        Self {
            config,
            processor,
            provider,
            interpreter,
            state: RunState::Init,
        }
    }

    /// Build the HTTP stack and template processor from configuration.
    ///
    /// Fails when no credential resolves or the system prompt is unreadable.
    pub fn from_config(config: Config) -> Result<Self> {
        let credentials =
            CredentialPool::new(&config.provider.name, config.resolve_credentials())?;
        let transport = HttpTransport::new(
            &config.provider.base_url,
            expand_headers(&config.provider.headers),
            config.provider.timeout_secs,
        )?;
        let provider = ProviderAdapter::new(
            Arc::new(transport),
            credentials,
            RetryPolicy::from(&config.provider),
        );
        let processor = TemplateProcessor::from_config(&config)?;

        Ok(Self::new(config, Box::new(processor), provider))
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Run state");
            self.state = next;
        }
    }

    /// Process the source and write the snapshot.
    pub async fn run(&mut self, source: &ItemSource) -> Result<RunReport> {
        self.state = RunState::Init;
        let result = self.execute(source).await;
        if result.is_err() {
            self.transition(RunState::Fatal);
        }
        result
    }

    async fn execute(&mut self, source: &ItemSource) -> Result<RunReport> {
        let start = Instant::now();

        self.transition(RunState::LoadingCheckpoint);
        let (log, run_id) = self.open_checkpoint()?;

        let mut budget =
            BudgetTracker::new(self.config.pricing.clone(), self.config.run.budget_usd);
        if self.config.run.resume {
            budget.resume_from(log.index().spend());
        }

        self.transition(RunState::Iterating);
        let mut counts = RunCounts::default();
        let mut selected = self.select(source, log.index(), &mut counts);

        let mut limit_stop = false;
        if let Some(limit) = self.config.run.limit {
            if selected.len() > limit {
                counts.beyond_limit = selected.len() - limit;
                selected.truncate(limit);
                limit_stop = true;
            }
        }

        info!(
            run_id = %run_id,
            resume = self.config.run.resume,
            total = source.len(),
            selected = selected.len(),
            already_done = counts.already_done,
            held_back = counts.held_back,
            budget_usd = ?self.config.run.budget_usd,
            spent_usd = budget.state().cost_usd,
            "Starting run"
        );

        let pb = self.progress_bar(selected.len());
        let mut pass = RunPass {
            run_id,
            log,
            budget,
            counts,
            calls_made: 0,
        };

        let mut budget_stop = false;
        let progress_every = self.config.run.progress_every;
        for (position, item) in selected.iter().enumerate() {
            let step = self.process_item(&mut pass, item).await?;

            pb.inc(1);
            pb.set_message(format!(
                "ok: {}, salvaged: {}, failed: {}, ${:.4}",
                pass.counts.succeeded,
                pass.counts.salvaged,
                pass.counts.failed,
                pass.budget.state().cost_usd
            ));
            if progress_every > 0 && (position + 1) % progress_every == 0 {
                info!(
                    processed = position + 1,
                    of = selected.len(),
                    succeeded = pass.counts.succeeded,
                    salvaged = pass.counts.salvaged,
                    failed = pass.counts.failed,
                    cost = format!("${:.4}", pass.budget.state().cost_usd),
                    "Progress"
                );
            }

            if let ItemStep::BudgetStop = step {
                budget_stop = true;
                break;
            }
        }

        self.transition(RunState::Finalizing);
        pass.log.flush()?;
        pb.finish_with_message(format!(
            "Done: {} ok, {} salvaged, {} failed",
            pass.counts.succeeded, pass.counts.salvaged, pass.counts.failed
        ));

        let meta = SnapshotMeta {
            run_id: pass.run_id.clone(),
            provider: self.config.provider.name.clone(),
            model: self.config.provider.model.clone(),
        };
        let snapshot = SnapshotWriter::render(source, pass.log.index(), &meta);
        let snapshot_path = self.config.output.snapshot_path.clone();
        SnapshotWriter::write(&snapshot, &snapshot_path)?;

        self.transition(RunState::Done);

        let report = RunReport {
            run_id: pass.run_id,
            resumed: self.config.run.resume,
            counts: pass.counts,
            budget_stop,
            limit_stop,
            spend: pass.budget.state().clone(),
            totals: snapshot.totals,
            provider: self.provider.stats(),
            snapshot_path,
            runtime_secs: start.elapsed().as_secs_f64(),
        };

        info!(
            run_id = %report.run_id,
            attempted = report.counts.attempted,
            success = report.totals.success,
            salvaged = report.totals.salvaged,
            failed = report.totals.failed,
            skipped = report.totals.skipped,
            missing = report.totals.missing,
            budget_stop = report.budget_stop,
            cost = format!("${:.4}", report.spend.cost_usd),
            "Run complete"
        );

        Ok(report)
    }

    /// Open the checkpoint for this run and settle the run id.
    fn open_checkpoint(&self) -> Result<(CheckpointLog, String)> {
        let path = &self.config.checkpoint.path;
        let run = &self.config.run;
        let existing = CheckpointLog::load(path)?;
        let conflict = |reason: String| TollgateError::CheckpointConflict {
            path: path.clone(),
            reason,
        };

        let run_id = if run.resume {
            let seen = existing.run_ids();
            match &run.run_id {
                Some(id) => {
                    let foreign: Vec<&str> =
                        seen.iter().map(String::as_str).filter(|r| *r != id.as_str()).collect();
                    if !foreign.is_empty() && !run.force {
                        return Err(conflict(format!(
                            "written by run(s) {}, not '{id}'",
                            foreign.join(", ")
                        )));
                    }
                    id.clone()
                }
                None if seen.len() <= 1 => seen.iter().next().cloned().unwrap_or_else(new_run_id),
                None if run.force => new_run_id(),
                None => {
                    return Err(conflict(format!(
                        "holds {} runs; choose one with --run-id",
                        seen.len()
                    )))
                }
            }
        } else {
            if CheckpointLog::has_content(path) {
                if !run.force {
                    return Err(conflict(format!(
                        "{} records from an earlier run; resume it or force a fresh run",
                        existing.total_records()
                    )));
                }
                CheckpointLog::supersede(path)?;
            }
            run.run_id.clone().unwrap_or_else(new_run_id)
        };

        let log = CheckpointLog::open(
            path,
            self.config.checkpoint.flush_every,
            self.config.checkpoint.fsync,
        )?;
        Ok((log, run_id))
    }

    /// Items this run should attempt, in source order.
    fn select<'a>(
        &self,
        source: &'a ItemSource,
        index: &CheckpointIndex,
        counts: &mut RunCounts,
    ) -> Vec<&'a Item> {
        source
            .iter()
            .filter(|item| match index.latest(&item.id).map(|r| r.status) {
                None | Some(OutcomeStatus::Skipped) => true,
                Some(status) if status.is_done() => {
                    counts.already_done += 1;
                    false
                }
                Some(status) if status.needs_explicit_retry() && !self.config.run.retry_failed => {
                    counts.held_back += 1;
                    false
                }
                Some(_) => true,
            })
            .collect()
    }

    async fn process_item(&mut self, pass: &mut RunPass, item: &Item) -> Result<ItemStep> {
        self.transition(RunState::Iterating);

        let request = match self.processor.build_request(item) {
            Ok(request) => request,
            Err(e) => {
                warn!(id = %item.id, error = %e, "Could not build request");
                pass.counts.failed += 1;
                self.transition(RunState::Recording);
                pass.log.append(CheckpointRecord::failed(
                    &item.id,
                    &pass.run_id,
                    e.to_string(),
                    None,
                    0.0,
                    0,
                ))?;
                return Ok(ItemStep::Continue);
            }
        };

        if let Some(max_chars) = self.config.run.max_input_chars {
            let chars = request.prompt_chars();
            if chars > max_chars {
                warn!(id = %item.id, chars = chars, max_chars = max_chars, "Request too large, skipping");
                pass.counts.skipped_oversize += 1;
                self.transition(RunState::Recording);
                pass.log.append(CheckpointRecord::skipped(
                    &item.id,
                    &pass.run_id,
                    SkipReason::Oversize,
                ))?;
                return Ok(ItemStep::Continue);
            }
        }

        self.transition(RunState::BudgetCheck);
        let estimate = pass.budget.estimate(&request);
        if pass.budget.will_exceed(&estimate) {
            warn!(
                id = %item.id,
                estimate_usd = estimate.cost_usd,
                spent_usd = pass.budget.state().cost_usd,
                ceiling_usd = ?pass.budget.ceiling_usd(),
                "Budget ceiling reached, stopping"
            );
            pass.counts.skipped_budget += 1;
            self.transition(RunState::Recording);
            pass.log.append(CheckpointRecord::skipped(
                &item.id,
                &pass.run_id,
                SkipReason::Budget,
            ))?;
            return Ok(ItemStep::BudgetStop);
        }

        let delay = Duration::from_millis(self.config.run.delay_ms);
        if pass.calls_made > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        pass.calls_made += 1;
        pass.counts.attempted += 1;

        self.transition(RunState::Calling);
        let record = match self.provider.call(&request).await {
            Ok(reply) => {
                self.transition(RunState::Interpreting);
                let interpreted = self.interpreter.parse(&reply.text);
                let cost = pass
                    .budget
                    .record_actual(reply.usage, &estimate, reply.attempts);

                if interpreted.is_complete() {
                    pass.counts.succeeded += 1;
                } else {
                    pass.counts.salvaged += 1;
                    warn!(id = %item.id, "Reply was malformed, salvaged for review");
                }
                debug!(
                    id = %item.id,
                    attempts = reply.attempts,
                    credential = %reply.credential,
                    cost_usd = cost,
                    "Item processed"
                );

                CheckpointRecord::interpreted(
                    &item.id,
                    &pass.run_id,
                    interpreted,
                    reply.text,
                    reply.usage,
                    cost,
                    reply.attempts,
                )
            }
            Err(failure) => {
                let cost = pass.budget.record_failure(failure.usage, failure.attempts);
                pass.counts.failed += 1;
                warn!(
                    id = %item.id,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Item failed"
                );

                CheckpointRecord::failed(
                    &item.id,
                    &pass.run_id,
                    failure.to_string(),
                    failure.usage,
                    cost,
                    failure.attempts,
                )
            }
        };

        self.transition(RunState::Recording);
        pass.log.append(record)?;
        Ok(ItemStep::Continue)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.run.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        pb.set_style(style);
        pb
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RawResponse;
    use crate::models::Usage;
    use crate::pipeline::{EntryStatus, RunSnapshot};
    use crate::test_support::{completion_body, ScriptedTransport};
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.checkpoint.path = dir.join("checkpoints").join("run.jsonl");
        config.output.snapshot_path = dir.join("output").join("snapshot.json");
        config.run.run_id = Some("run-1".to_string());
        config.run.delay_ms = 0;
        config.run.show_progress = false;
        config.pricing.input_price_per_1m = 1.0;
        config.pricing.output_price_per_1m = 2.0;
        config.provider.max_attempts = 3;
        config.provider.max_tokens = 100;
        config
    }

    fn processor(config: &Config) -> TemplateProcessor {
        TemplateProcessor::new(None, "{payload}", "m", config.provider.max_tokens, 0.0)
    }

    fn controller(config: &Config, transport: &Arc<ScriptedTransport>) -> RunController {
        let provider = ProviderAdapter::new(
            transport.clone(),
            CredentialPool::new("test", vec!["sk-test-0".to_string()]).unwrap(),
            RetryPolicy::from(&config.provider),
        );
        RunController::new(config.clone(), Box::new(processor(config)), provider)
    }

    fn ok(usage: Option<(u64, u64)>) -> RawResponse {
        RawResponse::new(
            200,
            completion_body(r#"{"verdict": "correct", "explanation": "fine", "issues": []}"#, usage),
        )
    }

    fn source(ids: &[&str]) -> ItemSource {
        ItemSource::new(ids.iter().map(|id| (*id, json!(format!("payload {id}"))))).unwrap()
    }

    fn read_snapshot(config: &Config) -> RunSnapshot {
        serde_json::from_slice(&std::fs::read(&config.output.snapshot_path).unwrap()).unwrap()
    }

    fn statuses(snapshot: &RunSnapshot) -> Vec<EntryStatus> {
        snapshot.entries.iter().map(|e| e.status).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_rate_limit_and_rejection() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(Some((100, 20))),
            RawResponse::new(429, "slow down"),
            ok(Some((200, 40))),
            RawResponse::new(400, r#"{"error":{"message":"invalid request"}}"#),
        ]));

        let mut controller = controller(&config, &transport);
        let report = controller.run(&source(&["A", "B", "C"])).await.unwrap();
        assert_eq!(controller.state(), RunState::Done);

        let snapshot = read_snapshot(&config);
        let ids: Vec<&str> = snapshot.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(
            statuses(&snapshot),
            vec![EntryStatus::Success, EntryStatus::Success, EntryStatus::Failed]
        );
        assert!(snapshot.entries[2].error.as_deref().unwrap().contains("400"));

        // A and B at their reported usage; C reported none and is free.
        let expected = (100.0 + 2.0 * 20.0) / 1e6 + (200.0 + 2.0 * 40.0) / 1e6;
        assert!((snapshot.totals.cost_usd - expected).abs() < 1e-12);
        assert!((report.spend.cost_usd - expected).abs() < 1e-12);
        assert_eq!(report.spend.requests, 4);
        assert_eq!(report.counts.attempted, 3);
        assert_eq!(report.provider.rate_limited, 1);

        let log = CheckpointLog::load(&config.checkpoint.path).unwrap();
        assert_eq!(log.latest("B").unwrap().attempts, 2);
        assert_eq!(log.latest("B").unwrap().usage, Some(Usage::new(200, 40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_run_converges_to_same_snapshot() {
        let ids = ["a", "b", "c", "d"];
        let uninterrupted = TempDir::new().unwrap();
        let config_full = config(uninterrupted.path());
        let transport = Arc::new(ScriptedTransport::repeating(ok(Some((10, 5)))));
        controller(&config_full, &transport)
            .run(&source(&ids))
            .await
            .unwrap();

        let interrupted = TempDir::new().unwrap();
        let mut config_part = config(interrupted.path());
        config_part.run.limit = Some(2);
        let first = Arc::new(ScriptedTransport::repeating(ok(Some((10, 5)))));
        let report = controller(&config_part, &first).run(&source(&ids)).await.unwrap();
        assert!(report.limit_stop);
        assert_eq!(first.calls(), 2);

        // Simulate a crash mid-write on the next record.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&config_part.checkpoint.path)
            .unwrap();
        std::io::Write::write_all(&mut file, br#"{"id":"c","run_id":"run-1","sta"#).unwrap();
        drop(file);

        config_part.run.limit = None;
        config_part.run.resume = true;
        let second = Arc::new(ScriptedTransport::repeating(ok(Some((10, 5)))));
        let report = controller(&config_part, &second).run(&source(&ids)).await.unwrap();
        assert_eq!(report.counts.already_done, 2);
        assert_eq!(second.prompts(), vec!["payload c", "payload d"]);

        let snapshot = read_snapshot(&config_part);
        assert_eq!(snapshot.entries.len(), ids.len());
        assert_eq!(
            std::fs::read(&config_full.output.snapshot_path).unwrap(),
            std::fs::read(&config_part.output.snapshot_path).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_gate_stops_before_overspending() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        let items = source(&["a", "b", "c", "d"]);
        let per_call = BudgetTracker::new(config.pricing.clone(), None)
            .estimate(&processor(&config).build_request(&items.items()[0]).unwrap())
            .cost_usd;
        config.run.budget_usd = Some(2.0 * per_call);

        // No usage reported, so each call is charged its estimate.
        let transport = Arc::new(ScriptedTransport::repeating(ok(None)));
        let report = controller(&config, &transport).run(&items).await.unwrap();

        assert_eq!(transport.calls(), 2);
        assert!(report.budget_stop);
        let snapshot = read_snapshot(&config);
        assert_eq!(
            statuses(&snapshot),
            vec![
                EntryStatus::Success,
                EntryStatus::Success,
                EntryStatus::Skipped,
                EntryStatus::Missing
            ]
        );
        assert_eq!(snapshot.entries[2].skip_reason, Some(SkipReason::Budget));

        // A larger budget picks the skipped item back up.
        config.run.resume = true;
        config.run.budget_usd = Some(4.0 * per_call);
        let report = controller(&config, &transport).run(&items).await.unwrap();
        assert!(!report.budget_stop);
        assert_eq!(transport.calls(), 4);
        assert_eq!(read_snapshot(&config).totals.success, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_rate_limited_fails_each_item_at_the_bound() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let transport = Arc::new(ScriptedTransport::repeating(RawResponse::new(429, "busy")));

        let report = controller(&config, &transport)
            .run(&source(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(transport.calls(), 6);
        assert_eq!(report.counts.failed, 2);
        let snapshot = read_snapshot(&config);
        assert_eq!(statuses(&snapshot), vec![EntryStatus::Failed, EntryStatus::Failed]);
        assert!(snapshot.entries[0]
            .error
            .as_deref()
            .unwrap()
            .contains("after 3 attempt(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_run_refuses_existing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        let transport = Arc::new(ScriptedTransport::repeating(ok(None)));
        controller(&config, &transport).run(&source(&["a"])).await.unwrap();

        let mut second = controller(&config, &transport);
        let err = second.run(&source(&["a"])).await.unwrap_err();
        assert!(err.is_fatal_setup());
        assert_eq!(second.state(), RunState::Fatal);
        assert_eq!(transport.calls(), 1);

        config.run.force = true;
        controller(&config, &transport).run(&source(&["a"])).await.unwrap();
        assert_eq!(transport.calls(), 2);
        let superseded = std::fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".superseded-"))
            .count();
        assert_eq!(superseded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_run_id_handling() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        let transport = Arc::new(ScriptedTransport::repeating(ok(None)));
        controller(&config, &transport).run(&source(&["a"])).await.unwrap();

        config.run.resume = true;
        config.run.run_id = Some("run-2".to_string());
        let err = controller(&config, &transport)
            .run(&source(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::CheckpointConflict { .. }));

        config.run.run_id = None;
        let report = controller(&config, &transport)
            .run(&source(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(report.run_id, "run-1");
        assert_eq!(report.counts.attempted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_items_retry_only_on_request() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(None),
            RawResponse::new(400, "bad"),
        ]));
        controller(&config, &transport)
            .run(&source(&["a", "b"]))
            .await
            .unwrap();

        config.run.resume = true;
        let retry = Arc::new(ScriptedTransport::repeating(ok(None)));
        let report = controller(&config, &retry)
            .run(&source(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(retry.calls(), 0);
        assert_eq!(report.counts.held_back, 1);
        assert_eq!(report.totals.failed, 1);

        config.run.retry_failed = true;
        let report = controller(&config, &retry)
            .run(&source(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(retry.prompts(), vec!["payload b"]);
        assert_eq!(report.totals.success, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_salvaged_reply_is_recorded_for_review() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let transport = Arc::new(ScriptedTransport::new(vec![RawResponse::new(
            200,
            completion_body(r#"{"verdict": "incorrect", "issues": ["dose", "cita"#, None),
        )]));

        let report = controller(&config, &transport)
            .run(&source(&["a"]))
            .await
            .unwrap();
        assert_eq!(report.counts.salvaged, 1);

        let record = CheckpointLog::load(&config.checkpoint.path)
            .unwrap()
            .latest("a")
            .cloned()
            .unwrap();
        assert_eq!(record.status, OutcomeStatus::Salvaged);
        assert!(record.needs_review);
        assert!(record.raw_response.unwrap().contains("cita"));
        let result = record.result.unwrap();
        assert_eq!(result.classification.as_deref(), Some("incorrect"));
        assert_eq!(result.array_field("issues").unwrap(), &vec![json!("dose")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversize_items_are_skipped_and_run_continues() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.run.max_input_chars = Some(9);
        let items = ItemSource::new(vec![
            ("long", json!("this payload is far too long")),
            ("short", json!("tiny")),
        ])
        .unwrap();
        let transport = Arc::new(ScriptedTransport::repeating(ok(None)));

        let report = controller(&config, &transport).run(&items).await.unwrap();
        assert_eq!(report.counts.skipped_oversize, 1);
        assert_eq!(transport.prompts(), vec!["tiny"]);
        let snapshot = read_snapshot(&config);
        assert_eq!(snapshot.entries[0].skip_reason, Some(SkipReason::Oversize));
        assert_eq!(snapshot.entries[1].status, EntryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_between_calls() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.run.delay_ms = 1_000;
        let transport = Arc::new(ScriptedTransport::repeating(ok(None)));

        let started = tokio::time::Instant::now();
        controller(&config, &transport)
            .run(&source(&["a", "b", "c"]))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
