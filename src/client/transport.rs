//! Wire types and the HTTP transport for OpenAI-compatible endpoints.
//!
//! The transport only moves bytes: it reports status, the Retry-After hint
//! and the body. Classification, rotation and retries live in the provider
//! adapter so they can be exercised against a scripted transport.

use super::Credential;
use crate::models::{ProviderError, Result, TollgateError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Chat completion request payload.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        messages: Vec<Message>,
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            temperature,
            response_format: None,
        }
    }

    /// Ask for a JSON object reply.
    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.response_format = enabled.then_some(ResponseFormat {
            kind: "json_object",
        });
        self
    }

    /// Total characters of message content.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Unclassified HTTP response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, in seconds
    pub retry_after_secs: Option<f64>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after_secs: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, secs: f64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}

/// Sends one chat completion request with one credential.
///
/// Implementations return `Err` only for failures below HTTP (timeouts,
/// connection errors); every HTTP status comes back as a `RawResponse`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> std::result::Result<RawResponse, ProviderError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    custom_headers: HashMap<String, String>,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `base_url` (without the `/chat/completions` suffix).
    pub fn new(
        base_url: impl Into<String>,
        custom_headers: HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TollgateError::Internal(format!("Building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            custom_headers,
            timeout,
        })
    }

    /// Build headers for a request.
    fn headers(&self, credential: &Credential) -> std::result::Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();

        let auth = HeaderValue::from_str(&format!("Bearer {}", credential.expose())).map_err(
            |_| ProviderError::Unauthorized {
                credential: credential.label().to_string(),
            },
        )?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Title", HeaderValue::from_static("tollgate"));

        for (key, value) in &self.custom_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> std::result::Result<RawResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(credential)?)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Network(e.without_url().to_string())
                }
            })?;

        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0);

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.without_url().to_string()))?;

        debug!(
            credential = %credential.label(),
            status = status,
            bytes = body.len(),
            "Provider responded"
        );

        Ok(RawResponse {
            status,
            retry_after_secs,
            body,
        })
    }
}
