//! Scripted transport and fixtures shared by unit tests.

use crate::client::{ChatRequest, Credential, RawResponse, Transport};
use crate::models::ProviderError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

type Scripted = std::result::Result<RawResponse, ProviderError>;

/// Transport that replays a fixed script of responses.
///
/// Once the script runs out, the fallback response (if any) is repeated;
/// otherwise the call fails with a network error.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<RawResponse>,
    log: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<RawResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            fallback: None,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: RawResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: RawResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    /// Number of requests received.
    pub fn calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Credential label used for each request, in order.
    pub fn credentials_used(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Last user message of each request, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, credential: &Credential, request: &ChatRequest) -> Scripted {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .push((credential.label().to_string(), prompt));

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(next) => next,
            None => match &self.fallback {
                Some(response) => Ok(response.clone()),
                None => Err(ProviderError::Network("script exhausted".to_string())),
            },
        }
    }
}

/// OpenAI-style completion body with `text` as the assistant message.
pub fn completion_body(text: &str, usage: Option<(u64, u64)>) -> String {
    let mut body = serde_json::json!({
        "model": "scripted/model",
        "choices": [{ "message": { "role": "assistant", "content": text } }],
    });
    if let Some((prompt, completion)) = usage {
        body["usage"] = serde_json::json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
        });
    }
    body.to_string()
}
