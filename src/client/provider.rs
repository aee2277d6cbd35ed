//! Provider adapter: one logical call, many HTTP attempts.
//!
//! Policy per response:
//! - 2xx: parse the completion envelope and return
//! - 401 / 429 with another untried credential: rotate and retry immediately
//! - 429 otherwise: wait for Retry-After (or a fixed backoff) and retry
//! - 5xx, timeouts, connection errors: exponential backoff and retry
//! - any other status: fail without retrying
//!
//! Every HTTP request counts toward `max_attempts`.

use super::{ChatRequest, CredentialPool, CredentialSummary, RawResponse, Transport};
use crate::models::{CallFailure, ProviderConfig, ProviderError, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<ChatUsage> for Usage {
    fn from(u: ChatUsage) -> Self {
        Usage::new(u.prompt_tokens, u.completion_tokens)
    }
}

/// API error response (OpenAI-compatible), possibly carrying usage.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Successful provider call.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Assistant message text
    pub text: String,
    /// Provider-reported usage, if any
    pub usage: Option<Usage>,
    /// Model that served the request
    pub model: String,
    /// HTTP requests made, rotations and retries included
    pub attempts: u32,
    /// Label of the credential that succeeded
    pub credential: String,
}

/// Retry and backoff tuning.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff for the n-th server-side retry (0-based).
    pub fn server_backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Wait after a 429 once no other credential is left to try.
    pub fn rate_limit_wait(&self, hint_secs: Option<f64>) -> Duration {
        match hint_secs {
            Some(secs) if secs.is_nan() || secs <= 0.0 => Duration::ZERO,
            Some(secs) => Duration::try_from_secs_f64(secs)
                .unwrap_or(self.backoff_max)
                .min(self.backoff_max),
            None => self.rate_limit_backoff,
        }
    }
}

impl From<&ProviderConfig> for RetryPolicy {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub calls: u64,
    pub requests: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub rotations: u64,
    pub backoff_secs: f64,
    pub credentials: Vec<CredentialSummary>,
}

/// Performs provider calls with credential rotation and bounded retries.
pub struct ProviderAdapter {
    transport: Arc<dyn Transport>,
    credentials: CredentialPool,
    policy: RetryPolicy,
    stats: ProviderStats,
}

impl ProviderAdapter {
    pub fn new(transport: Arc<dyn Transport>, credentials: CredentialPool, policy: RetryPolicy) -> Self {
        Self {
            transport,
            credentials,
            policy,
            stats: ProviderStats::default(),
        }
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    pub fn stats(&self) -> ProviderStats {
        let mut stats = self.stats.clone();
        stats.credentials = self.credentials.summaries();
        stats
    }

    async fn pause(&mut self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        self.stats.backoff_secs += wait.as_secs_f64();
        tokio::time::sleep(wait).await;
    }

    /// Perform one logical call.
    pub async fn call(&mut self, request: &ChatRequest) -> Result<ProviderReply, CallFailure> {
        self.stats.calls += 1;

        let mut attempts = 0u32;
        let mut server_retries = 0u32;
        let mut failed_usage: Option<Usage> = None;
        let mut last_error = ProviderError::CredentialsExhausted;
        let mut tried: HashSet<usize> = HashSet::new();

        while attempts < self.policy.max_attempts {
            let Some((index, credential)) = self.credentials.active() else {
                last_error = ProviderError::CredentialsExhausted;
                break;
            };
            let credential = credential.clone();
            tried.insert(index);

            attempts += 1;
            self.stats.requests += 1;
            self.credentials.record_request(index);
            let more_attempts = attempts < self.policy.max_attempts;

            let raw = match self.transport.send(&credential, request).await {
                Ok(raw) => raw,
                Err(ProviderError::Unauthorized { credential }) => {
                    // Credential could not even be encoded into a header.
                    self.credentials.revoke(index);
                    last_error = ProviderError::Unauthorized { credential };
                    continue;
                }
                Err(e) => {
                    last_error = self.scrub_error(e);
                    if more_attempts {
                        let wait = self.policy.server_backoff(server_retries);
                        server_retries += 1;
                        debug!(
                            attempt = attempts,
                            backoff_ms = wait.as_millis() as u64,
                            error = %last_error,
                            "Retrying after transport error"
                        );
                        self.pause(wait).await;
                    }
                    continue;
                }
            };

            match raw.status {
                200..=299 => {
                    self.credentials.record_success(index);
                    return self.parse_success(raw, request, attempts, credential.label());
                }
                401 => {
                    let (message, usage) = self.error_details(&raw);
                    accumulate(&mut failed_usage, usage);
                    debug!(credential = %credential.label(), message = %message, "Unauthorized");
                    self.credentials.revoke(index);
                    last_error = ProviderError::Unauthorized {
                        credential: credential.label().to_string(),
                    };
                    if self.credentials.rotate(&tried).is_some() {
                        self.stats.rotations += 1;
                        continue;
                    }
                    if self.credentials.usable() == 0 {
                        break;
                    }
                    // Remaining keys were already rate limited this round.
                    if more_attempts {
                        let wait = self.policy.rate_limit_wait(None);
                        self.pause(wait).await;
                        tried.clear();
                    }
                }
                429 => {
                    self.stats.rate_limited += 1;
                    self.credentials.record_429(index);
                    let (message, usage) = self.error_details(&raw);
                    accumulate(&mut failed_usage, usage);
                    last_error = ProviderError::RateLimited {
                        message,
                        retry_after_secs: raw.retry_after_secs,
                    };
                    if !more_attempts {
                        break;
                    }
                    if self.credentials.rotate(&tried).is_some() {
                        self.stats.rotations += 1;
                        continue;
                    }
                    let wait = self.policy.rate_limit_wait(raw.retry_after_secs);
                    debug!(
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited on every credential, waiting"
                    );
                    self.pause(wait).await;
                    tried.clear();
                }
                500..=599 => {
                    self.stats.server_errors += 1;
                    let (message, usage) = self.error_details(&raw);
                    accumulate(&mut failed_usage, usage);
                    last_error = ProviderError::Server {
                        status: raw.status,
                        message,
                    };
                    if more_attempts {
                        let wait = self.policy.server_backoff(server_retries);
                        server_retries += 1;
                        debug!(
                            attempt = attempts,
                            status = raw.status,
                            backoff_ms = wait.as_millis() as u64,
                            "Server error, backing off"
                        );
                        self.pause(wait).await;
                    }
                }
                status => {
                    let (message, usage) = self.error_details(&raw);
                    accumulate(&mut failed_usage, usage);
                    let error = ProviderError::Rejected { status, message };
                    warn!(status = status, error = %error, "Request rejected, not retrying");
                    return Err(CallFailure {
                        error,
                        attempts,
                        usage: failed_usage,
                    });
                }
            }
        }

        warn!(attempts = attempts, error = %last_error, "Provider call gave up");
        Err(CallFailure {
            error: last_error,
            attempts,
            usage: failed_usage,
        })
    }

    fn parse_success(
        &self,
        raw: RawResponse,
        request: &ChatRequest,
        attempts: u32,
        credential: &str,
    ) -> Result<ProviderReply, CallFailure> {
        let invalid = |message: String| CallFailure {
            error: ProviderError::InvalidResponse(message),
            attempts,
            usage: None,
        };

        let body: ChatCompletionResponse = serde_json::from_str(&raw.body)
            .map_err(|e| invalid(format!("Failed to parse response: {e}")))?;
        let usage = body.usage.map(Usage::from);

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CallFailure {
                error: ProviderError::InvalidResponse("No choices in response".to_string()),
                attempts,
                usage,
            })?;

        Ok(ProviderReply {
            text,
            usage,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            attempts,
            credential: credential.to_string(),
        })
    }

    /// Extract a scrubbed message and any usage from an error body.
    fn error_details(&self, raw: &RawResponse) -> (String, Option<Usage>) {
        let parsed = serde_json::from_str::<ApiErrorResponse>(&raw.body).ok();
        let usage = parsed.as_ref().and_then(|p| p.usage).map(Usage::from);
        let message = parsed
            .and_then(|p| p.error)
            .map(|e| e.message)
            .unwrap_or_else(|| truncate(&raw.body, 300));
        (self.credentials.scrub(&message), usage)
    }

    fn scrub_error(&self, error: ProviderError) -> ProviderError {
        match error {
            ProviderError::Network(message) => ProviderError::Network(self.credentials.scrub(&message)),
            other => other,
        }
    }
}

fn accumulate(total: &mut Option<Usage>, usage: Option<Usage>) {
    if let Some(usage) = usage {
        let sum = total.get_or_insert_with(Usage::default);
        sum.input_tokens += usage.input_tokens;
        sum.output_tokens += usage.output_tokens;
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
