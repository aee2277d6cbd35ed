//! Configuration models for tollgate.
//!
//! Every tunable is resolved here from a TOML file; CLI flags override the
//! `[run]` table at startup.

use crate::interpret::ResponseSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Top-level configuration for tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Provider endpoint and credentials
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Token prices used for budget accounting
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Run behaviour (resume, limits, budget, pacing)
    #[serde(default)]
    pub run: RunConfig,

    /// Checkpoint log settings
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Snapshot output settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Prompt construction
    #[serde(default)]
    pub prompts: PromptsConfig,

    /// Expected reply schema
    #[serde(default)]
    pub schema: ResponseSchema,
}

/// Provider (OpenAI-compatible endpoint) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider label recorded in snapshots
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model id sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Explicit API keys, tried in order; `${VAR}` is expanded
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Environment variables holding further API keys, tried in order
    #[serde(default = "default_api_key_envs")]
    pub api_key_envs: Vec<String>,

    /// Custom headers; values may contain `${VAR}`
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum HTTP requests per item, rotations included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff after a server error, doubled on each retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on any single backoff
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Wait after a 429 when the provider sends no Retry-After hint
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,

    /// Maximum completion tokens requested
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Ask the provider for a JSON object reply
    #[serde(default)]
    pub json_mode: bool,
}

fn default_provider_name() -> String {
    "openrouter".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_api_key_envs() -> Vec<String> {
    vec!["OPENROUTER_API_KEY".to_string()]
}

fn default_timeout() -> u64 {
    180
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_rate_limit_backoff_ms() -> u64 {
    5_000
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f64 {
    0.2
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            model: default_model(),
            api_keys: Vec::new(),
            api_key_envs: default_api_key_envs(),
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            json_mode: false,
        }
    }
}

/// Token pricing for budget accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Input price per 1M tokens (USD)
    #[serde(default)]
    pub input_price_per_1m: f64,

    /// Output price per 1M tokens (USD)
    #[serde(default)]
    pub output_price_per_1m: f64,

    /// Expected completion size used by the pre-call estimate
    #[serde(default)]
    pub expected_output_tokens: Option<u64>,

    /// Characters per token used to size prompts
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

fn default_chars_per_token() -> f64 {
    4.0
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_price_per_1m: 0.0,
            output_price_per_1m: 0.0,
            expected_output_tokens: None,
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// Run behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run identifier stamped on every record; generated when absent
    #[serde(default)]
    pub run_id: Option<String>,

    /// Continue from an existing checkpoint
    #[serde(default)]
    pub resume: bool,

    /// Override checkpoint conflicts
    #[serde(default)]
    pub force: bool,

    /// Maximum items attempted in this run
    #[serde(default)]
    pub limit: Option<usize>,

    /// Spend ceiling in USD (unlimited when absent)
    #[serde(default)]
    pub budget_usd: Option<f64>,

    /// Per-call prompt size limit in characters
    #[serde(default)]
    pub max_input_chars: Option<usize>,

    /// Fixed pause between provider calls
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Retry items previously recorded as failed or salvaged
    #[serde(default)]
    pub retry_failed: bool,

    /// Log progress every N items
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Draw a progress bar on stderr
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_delay_ms() -> u64 {
    500
}

fn default_progress_every() -> usize {
    25
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            resume: false,
            force: false,
            limit: None,
            budget_usd: None,
            max_input_chars: None,
            delay_ms: default_delay_ms(),
            retry_failed: false,
            progress_every: default_progress_every(),
            show_progress: true,
        }
    }
}

/// Checkpoint log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path of the JSONL checkpoint log
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Flush the writer every N appends (1 = every write)
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// Sync file data to disk at each flush
    #[serde(default)]
    pub fsync: bool,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("checkpoints/run.jsonl")
}

fn default_flush_every() -> usize {
    1
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            flush_every: default_flush_every(),
            fsync: false,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Snapshot file path
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("output/snapshot.json")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Prompt construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Path to the system prompt file
    #[serde(default)]
    pub system_prompt: Option<PathBuf>,

    /// User message template; `{payload}` and `{id}` are substituted
    #[serde(default = "default_user_template")]
    pub user_template: String,
}

fn default_user_template() -> String {
    "{payload}".to_string()
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            user_template: default_user_template(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "provider.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.flush_every == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint.flush_every must be at least 1".to_string(),
            ));
        }
        if self.pricing.chars_per_token <= 0.0 {
            return Err(ConfigError::Invalid(
                "pricing.chars_per_token must be positive".to_string(),
            ));
        }
        if self.run.budget_usd.is_some_and(|b| b < 0.0) {
            return Err(ConfigError::Invalid(
                "run.budget_usd must not be negative".to_string(),
            ));
        }
        self.schema.validate().map_err(ConfigError::Invalid)
    }

    /// Resolve the ordered credential list.
    ///
    /// Explicit keys come first, then environment variables. Keys whose
    /// `${VAR}` placeholders did not expand are dropped.
    pub fn resolve_credentials(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .provider
            .api_keys
            .iter()
            .map(|k| expand_env_vars(k))
            .filter(|k| !k.trim().is_empty() && !env_pattern().is_match(k))
            .collect();

        for env_var in &self.provider.api_key_envs {
            if let Ok(key) = std::env::var(env_var) {
                if !key.trim().is_empty() && !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        keys
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("env pattern is a valid regex"))
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in env_pattern().captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[provider]
model = "anthropic/claude-sonnet-4"

[run]
budget_usd = 5.0
"#,
        )
        .unwrap();

        assert_eq!(config.provider.model, "anthropic/claude-sonnet-4");
        assert_eq!(config.provider.max_attempts, 5);
        assert_eq!(config.run.budget_usd, Some(5.0));
        assert_eq!(config.run.delay_ms, 500);
        assert_eq!(config.checkpoint.flush_every, 1);
        assert_eq!(config.schema.classification.field, "verdict");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.provider.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_credentials_order_and_expansion() {
        std::env::set_var("TOLLGATE_TEST_KEY_A", "sk-a");
        std::env::set_var("TOLLGATE_TEST_KEY_B", "sk-b");

        let mut config = Config::default();
        config.provider.api_keys = vec![
            "sk-literal".to_string(),
            "${TOLLGATE_TEST_KEY_A}".to_string(),
            "${TOLLGATE_TEST_UNSET_KEY}".to_string(),
        ];
        config.provider.api_key_envs = vec![
            "TOLLGATE_TEST_KEY_B".to_string(),
            "TOLLGATE_TEST_KEY_A".to_string(),
        ];

        assert_eq!(
            config.resolve_credentials(),
            vec!["sk-literal", "sk-a", "sk-b"]
        );
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown() {
        std::env::set_var("TOLLGATE_TEST_ORG", "acme");
        assert_eq!(
            expand_env_vars("org=${TOLLGATE_TEST_ORG} x=${TOLLGATE_NOPE}"),
            "org=acme x=${TOLLGATE_NOPE}"
        );
    }
}
