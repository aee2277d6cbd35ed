//! Request construction for items.

use crate::client::{ChatRequest, Message};
use crate::models::{Config, Item, Result, TollgateError};
use serde_json::Value;
use std::path::Path;

/// Turns an item into a provider request.
///
/// Domain processors (answer correction, fact checking, ...) implement this;
/// the controller only needs the request.
pub trait ItemProcessor: Send + Sync {
    fn build_request(&self, item: &Item) -> Result<ChatRequest>;
}

/// Template-driven processor.
///
/// `{payload}` in the user template is replaced with the item payload (string
/// payloads verbatim, anything else as pretty JSON) and `{id}` with the item id.
#[derive(Debug, Clone)]
pub struct TemplateProcessor {
    system_prompt: Option<String>,
    user_template: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    json_mode: bool,
}

impl TemplateProcessor {
    pub fn new(
        system_prompt: Option<String>,
        user_template: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        Self {
            system_prompt,
            user_template: user_template.into(),
            model: model.into(),
            max_tokens,
            temperature,
            json_mode: false,
        }
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    /// Build from configuration, reading the system prompt file if one is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let system_prompt = config
            .prompts
            .system_prompt
            .as_deref()
            .map(read_prompt)
            .transpose()?;

        Ok(Self::new(
            system_prompt,
            config.prompts.user_template.clone(),
            config.provider.model.clone(),
            config.provider.max_tokens,
            config.provider.temperature,
        )
        .with_json_mode(config.provider.json_mode))
    }

    fn render(&self, item: &Item) -> String {
        let payload = match &item.payload {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        self.user_template
            .replace("{id}", &item.id)
            .replace("{payload}", &payload)
    }
}

impl ItemProcessor for TemplateProcessor {
    fn build_request(&self, item: &Item) -> Result<ChatRequest> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(self.render(item)));

        Ok(
            ChatRequest::new(&self.model, messages, self.max_tokens, self.temperature)
                .with_json_mode(self.json_mode),
        )
    }
}

fn read_prompt(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| TollgateError::io(format!("reading system prompt {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str, payload: Value) -> Item {
        Item {
            id: id.to_string(),
            index: 0,
            payload,
        }
    }

    #[test]
    fn test_string_payload_is_verbatim() {
        let processor = TemplateProcessor::new(None, "[{id}] {payload}", "m", 100, 0.0);
        let request = processor
            .build_request(&item("q1", json!("What is {id}?")))
            .unwrap();
        assert_eq!(request.messages.len(), 1);
        // The id is substituted before the payload, so payload text is left alone.
        assert_eq!(request.messages[0].content, "[q1] What is {id}?");
    }

    #[test]
    fn test_object_payload_is_pretty_json() {
        let processor = TemplateProcessor::new(Some("Be strict.".into()), "{payload}", "m", 100, 0.0);
        let request = processor
            .build_request(&item("q2", json!({"question": "2+2", "answer": "4"})))
            .unwrap();
        assert_eq!(request.messages[0].role, "system");
        let user = &request.messages[1].content;
        assert!(user.contains("\"question\": \"2+2\""));
        assert!(user.contains('\n'));
    }

    #[test]
    fn test_from_config_reads_prompt_file() {
        let dir = TempDir::new().unwrap();
        let prompt = dir.path().join("system.md");
        std::fs::write(&prompt, "You review answers.").unwrap();

        let mut config = Config::default();
        config.prompts.system_prompt = Some(prompt);
        config.provider.json_mode = true;
        let processor = TemplateProcessor::from_config(&config).unwrap();
        let request = processor.build_request(&item("a", json!("x"))).unwrap();
        assert_eq!(request.messages[0].content, "You review answers.");
        assert_eq!(request.model, config.provider.model);

        config.prompts.system_prompt = Some(dir.path().join("missing.md"));
        assert!(TemplateProcessor::from_config(&config).is_err());
    }
}
