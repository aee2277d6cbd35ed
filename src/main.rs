//! tollgate CLI - resumable, budget-gated batch processing through LLM endpoints.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tollgate::{
    CheckpointLog, Config, CredentialPool, ItemSource, RunController, RunReport, SnapshotMeta,
    SnapshotWriter,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(version)]
#[command(about = "Resumable, budget-gated batch processing through LLM endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process items, resuming from the checkpoint when asked
    Run {
        /// Path to input items JSONL file
        #[arg(short, long)]
        items: PathBuf,

        #[command(flatten)]
        paths: PathArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Re-render the snapshot from the checkpoint without calling the provider
    Snapshot {
        /// Path to input items JSONL file
        #[arg(short, long)]
        items: PathBuf,

        #[command(flatten)]
        paths: PathArgs,

        /// Run id for the snapshot header
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Args)]
struct PathArgs {
    /// Checkpoint log (overrides [checkpoint].path)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Snapshot file (overrides [output].snapshot_path)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    /// Run identifier
    #[arg(long)]
    run_id: Option<String>,

    /// Continue from the existing checkpoint
    #[arg(long)]
    resume: bool,

    /// Override checkpoint conflicts (supersedes the old log on fresh runs)
    #[arg(long)]
    force: bool,

    /// Attempt at most this many items
    #[arg(long)]
    limit: Option<usize>,

    /// Spend ceiling in USD
    #[arg(long)]
    budget: Option<f64>,

    /// Skip requests longer than this many characters
    #[arg(long)]
    max_input_chars: Option<usize>,

    /// Delay between provider calls in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Retry items whose last outcome was failed or salvaged
    #[arg(long)]
    retry_failed: bool,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl PathArgs {
    fn apply(self, config: &mut Config) {
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint.path = checkpoint;
        }
        if let Some(output) = self.output {
            config.output.snapshot_path = output;
        }
    }
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        let run = &mut config.run;
        if self.run_id.is_some() {
            run.run_id = self.run_id;
        }
        run.resume |= self.resume;
        run.force |= self.force;
        run.retry_failed |= self.retry_failed;
        if self.limit.is_some() {
            run.limit = self.limit;
        }
        if self.budget.is_some() {
            run.budget_usd = self.budget;
        }
        if self.max_input_chars.is_some() {
            run.max_input_chars = self.max_input_chars;
        }
        if let Some(delay_ms) = self.delay_ms {
            run.delay_ms = delay_ms;
        }
        if self.no_progress {
            run.show_progress = false;
        }
    }
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_example_config() {
    let example = r#"# tollgate configuration file

[provider]
name = "openrouter"
base_url = "https://openrouter.ai/api/v1"
model = "openai/gpt-4o-mini"
# Tried in order; ${VAR} is expanded from the environment
api_keys = ["${OPENROUTER_API_KEY}", "${OPENROUTER_API_KEY_BACKUP}"]
api_key_envs = ["OPENROUTER_API_KEY"]
timeout_secs = 180
max_attempts = 5
backoff_base_ms = 1000
backoff_max_ms = 60000
rate_limit_backoff_ms = 5000
max_tokens = 2048
temperature = 0.2
json_mode = true

[pricing]
input_price_per_1m = 0.15
output_price_per_1m = 0.60
expected_output_tokens = 600

[run]
# run_id = "review-2024-06"
resume = false
# limit = 100
budget_usd = 5.0
max_input_chars = 24000
delay_ms = 500
retry_failed = false
progress_every = 25

[checkpoint]
path = "checkpoints/run.jsonl"
flush_every = 1
fsync = false

[output]
snapshot_path = "output/snapshot.json"

[prompts]
system_prompt = "prompts/system.md"
user_template = "Review this item ({id}):\n\n{payload}"

[schema]
string_fields = ["corrected_text", "explanation"]
array_fields = ["issues"]

[schema.classification]
field = "verdict"
allowed = ["correct", "incorrect", "partially_correct", "needs_review"]
default = "needs_review"
"#;
    println!("{example}");
}

fn print_report(report: &RunReport) {
    let totals = &report.totals;
    println!("\n=== Run Complete ===");
    println!("Run id:      {}", report.run_id);
    println!("Items:       {}", totals.items);
    println!("Attempted:   {}", report.counts.attempted);
    println!("Success:     {}", totals.success);
    println!("Salvaged:    {}", totals.salvaged);
    println!("Failed:      {}", totals.failed);
    println!("Skipped:     {}", totals.skipped);
    println!("Missing:     {}", totals.missing);
    println!("Review:      {}", totals.needs_review);
    if report.budget_stop {
        println!("Stopped:     budget ceiling reached");
    } else if report.limit_stop {
        println!("Stopped:     item limit reached");
    }
    println!("Requests:    {}", report.provider.requests);
    println!("Rate limits: {}", report.provider.rate_limited);
    println!("Rotations:   {}", report.provider.rotations);
    for credential in &report.provider.credentials {
        println!(
            "  {}: {} requests, {} rate limited{}",
            credential.label,
            credential.requests,
            credential.rate_limited,
            if credential.revoked { ", revoked" } else { "" }
        );
    }
    println!("Spend:       ${:.4}", report.spend.cost_usd);
    println!("Runtime:     {:.1}s", report.runtime_secs);
    println!("Snapshot:    {:?}", report.snapshot_path);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let credentials = CredentialPool::new(&config.provider.name, config.resolve_credentials())
                .context("Failed to resolve credentials")?;

            info!("Configuration is valid");
            info!("  Provider: {} ({})", config.provider.name, config.provider.model);
            info!("  Credentials: {}", credentials.len());
            info!("  Max attempts: {}", config.provider.max_attempts);
            match config.run.budget_usd {
                Some(budget) => info!("  Budget: ${budget:.2}"),
                None => info!("  Budget: unlimited"),
            }
            info!("  Checkpoint: {:?}", config.checkpoint.path);
        }

        Commands::Run { items, paths, run } => {
            let mut config = load_config(&cli.config)?;
            paths.apply(&mut config);
            run.apply(&mut config);
            config.validate().context("Invalid configuration")?;

            let source = ItemSource::from_jsonl(&items)
                .with_context(|| format!("Failed to load items from {items:?}"))?;
            let mut controller =
                RunController::from_config(config).context("Failed to set up run")?;

            let report = controller.run(&source).await?;
            print_report(&report);
        }

        Commands::Snapshot {
            items,
            paths,
            run_id,
        } => {
            let mut config = load_config(&cli.config)?;
            paths.apply(&mut config);
            if run_id.is_some() {
                config.run.run_id = run_id;
            }

            let source = ItemSource::from_jsonl(&items)
                .with_context(|| format!("Failed to load items from {items:?}"))?;
            let index = CheckpointLog::load(&config.checkpoint.path)
                .context("Failed to read checkpoint")?;

            let meta = SnapshotMeta::for_checkpoint(&config, &index);
            let snapshot = SnapshotWriter::render(&source, &index, &meta);
            SnapshotWriter::write(&snapshot, &config.output.snapshot_path)?;

            let totals = &snapshot.totals;
            println!("\n=== Snapshot ===");
            println!("Items:       {}", totals.items);
            println!("Success:     {}", totals.success);
            println!("Salvaged:    {}", totals.salvaged);
            println!("Failed:      {}", totals.failed);
            println!("Skipped:     {}", totals.skipped);
            println!("Missing:     {}", totals.missing);
            println!("Total spend: ${:.4}", totals.spend.cost_usd);
            if index.skipped_lines() > 0 {
                println!("Torn lines:  {}", index.skipped_lines());
            }
            println!("Output:      {:?}", config.output.snapshot_path);
        }
    }

    Ok(())
}
