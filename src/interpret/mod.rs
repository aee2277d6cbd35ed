//! Response interpretation.
//!
//! Turns raw provider text into an `ItemResult`:
//! 1. Strip code fences and any prose around the outermost object
//! 2. Strict JSON parse, normalizing the classification into the allowed set
//! 3. On failure, salvage whatever fields can be recovered (see `salvage`)

mod salvage;

use crate::models::{ItemResult, StructuredResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Classification field and its closed value set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationField {
    /// JSON key holding the classification
    #[serde(default = "default_classification_field")]
    pub field: String,

    /// Allowed values, lowercase
    #[serde(default = "default_allowed")]
    pub allowed: Vec<String>,

    /// Value used when the reply's value is missing or not allowed
    #[serde(default = "default_classification")]
    pub default: String,
}

fn default_classification_field() -> String {
    "verdict".to_string()
}

fn default_allowed() -> Vec<String> {
    ["correct", "incorrect", "partially_correct", "needs_review"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_classification() -> String {
    "needs_review".to_string()
}

impl Default for ClassificationField {
    fn default() -> Self {
        Self {
            field: default_classification_field(),
            allowed: default_allowed(),
            default: default_classification(),
        }
    }
}

/// Fields expected in a provider reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSchema {
    #[serde(default)]
    pub classification: ClassificationField,

    /// Free-text fields
    #[serde(default = "default_string_fields")]
    pub string_fields: Vec<String>,

    /// List fields
    #[serde(default = "default_array_fields")]
    pub array_fields: Vec<String>,
}

fn default_string_fields() -> Vec<String> {
    vec!["corrected_text".to_string(), "explanation".to_string()]
}

fn default_array_fields() -> Vec<String> {
    vec!["issues".to_string()]
}

impl Default for ResponseSchema {
    fn default() -> Self {
        Self {
            classification: ClassificationField::default(),
            string_fields: default_string_fields(),
            array_fields: default_array_fields(),
        }
    }
}

impl ResponseSchema {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        let class = &self.classification;
        if class.field.trim().is_empty() {
            return Err("schema.classification.field must not be empty".to_string());
        }
        if class.allowed.is_empty() {
            return Err("schema.classification.allowed must not be empty".to_string());
        }
        if !class.allowed.iter().any(|a| a == &class.default) {
            return Err(format!(
                "schema.classification.default '{}' is not in the allowed set",
                class.default
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for name in self.field_names() {
            if !seen.insert(name) {
                return Err(format!("schema field '{name}' is declared twice"));
            }
        }
        Ok(())
    }

    /// Every expected key: classification first, then strings, then arrays.
    pub fn field_names(&self) -> Vec<&str> {
        std::iter::once(self.classification.field.as_str())
            .chain(self.string_fields.iter().map(String::as_str))
            .chain(self.array_fields.iter().map(String::as_str))
            .collect()
    }

    /// Map a raw label into the allowed set.
    ///
    /// Case, surrounding whitespace, spaces and hyphens are normalized;
    /// anything still outside the set becomes the default.
    pub fn normalize_classification(&self, raw: &str) -> String {
        let label = normalize_label(raw);
        if self.classification.allowed.iter().any(|a| a == &label) {
            label
        } else {
            self.classification.default.clone()
        }
    }
}

fn normalize_label(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Parses provider replies against a schema.
#[derive(Debug, Clone)]
pub struct ResponseInterpreter {
    schema: ResponseSchema,
}

impl ResponseInterpreter {
    pub fn new(schema: ResponseSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &ResponseSchema {
        &self.schema
    }

    /// Interpret one reply. Never fails: the worst case is `Unusable`.
    pub fn parse(&self, raw: &str) -> ItemResult {
        let unfenced = strip_code_fences(raw);
        if unfenced.trim().is_empty() {
            return ItemResult::Unusable {
                reason: "Empty reply".to_string(),
            };
        }

        let candidate = outermost_object(unfenced);
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => ItemResult::Complete(self.from_object(map)),
            Ok(other) => {
                debug!(kind = json_kind(&other), "Reply is JSON but not an object, salvaging");
                salvage::salvage(candidate, &self.schema)
            }
            Err(e) => {
                debug!(error = %e, chars = raw.len(), "Strict parse failed, salvaging");
                salvage::salvage(candidate, &self.schema)
            }
        }
    }

    /// Build a result from a well-formed object.
    fn from_object(&self, mut map: Map<String, Value>) -> StructuredResult {
        let mut result = StructuredResult::default();

        let label = map
            .remove(&self.schema.classification.field)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        result.classification = Some(self.schema.normalize_classification(&label));

        for name in &self.schema.string_fields {
            let value = match map.remove(name) {
                Some(Value::String(s)) => Some(s),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            };
            if let Some(value) = value {
                result.fields.insert(name.clone(), Value::String(value));
            }
        }

        for name in &self.schema.array_fields {
            match map.remove(name) {
                Some(Value::Array(items)) => {
                    result.fields.insert(name.clone(), Value::Array(items));
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    result
                        .fields
                        .insert(name.clone(), Value::Array(vec![other]));
                }
            }
        }

        result
    }
}

/// Remove a surrounding markdown code fence, if any.
///
/// A fence without a closing marker (truncated reply) keeps everything after
/// the opening line.
pub fn strip_code_fences(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw.trim();
    };
    let after_marker = &raw[open + 3..];
    // Skip the language tag line ("```json").
    let body = match after_marker.find('\n') {
        Some(nl) => &after_marker[nl + 1..],
        None => after_marker,
    };
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Slice from the first `{` to the last `}`, or to the end when unclosed.
fn outermost_object(text: &str) -> &str {
    let Some(start) = text.find('{') else {
        return text;
    };
    match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interpreter() -> ResponseInterpreter {
        ResponseInterpreter::new(ResponseSchema::default())
    }

    #[test]
    fn test_fenced_reply_with_prose() {
        let raw = "Here is my review:\n```json\n{\"verdict\": \" Partially Correct\", \"explanation\": \"close\", \"issues\": [\"units\"]}\n```\nThanks!";
        let ItemResult::Complete(result) = interpreter().parse(raw) else {
            panic!("expected complete result");
        };
        assert_eq!(result.classification.as_deref(), Some("partially_correct"));
        assert_eq!(result.string_field("explanation"), Some("close"));
        assert_eq!(result.array_field("issues").unwrap(), &vec![json!("units")]);
        assert!(result.string_field("corrected_text").is_none());
    }

    #[test]
    fn test_unknown_or_missing_classification_uses_default() {
        let interpreter = interpreter();
        for raw in [r#"{"verdict": "maybe"}"#, r#"{"explanation": "no verdict"}"#] {
            let ItemResult::Complete(result) = interpreter.parse(raw) else {
                panic!("expected complete result for {raw}");
            };
            assert_eq!(result.classification.as_deref(), Some("needs_review"));
        }
    }

    #[test]
    fn test_truncated_reply_is_salvaged() {
        let raw = r#"{"verdict": "incorrect", "issues": ["wrong dose", "missing citation", "outdated gui"#;
        let ItemResult::Salvaged { result, missing } = interpreter().parse(raw) else {
            panic!("expected salvaged result");
        };
        assert_eq!(result.classification.as_deref(), Some("incorrect"));
        assert_eq!(
            result.array_field("issues").unwrap(),
            &vec![json!("wrong dose"), json!("missing citation")]
        );
        assert_eq!(missing, vec!["corrected_text", "explanation"]);
    }

    #[test]
    fn test_garbage_is_unusable() {
        assert!(matches!(
            interpreter().parse("I cannot help with that."),
            ItemResult::Unusable { .. }
        ));
        assert!(matches!(interpreter().parse("  "), ItemResult::Unusable { .. }));
    }

    #[test]
    fn test_unclosed_fence() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1"), "{\"a\": 1");
        assert_eq!(strip_code_fences("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn test_schema_validation() {
        assert!(ResponseSchema::default().validate().is_ok());

        let mut schema = ResponseSchema::default();
        schema.classification.default = "unknown".to_string();
        assert!(schema.validate().unwrap_err().contains("allowed set"));

        let mut schema = ResponseSchema::default();
        schema.array_fields.push("explanation".to_string());
        assert!(schema.validate().unwrap_err().contains("declared twice"));
    }

    #[test]
    fn test_custom_schema_from_toml() {
        let schema: ResponseSchema = toml::from_str(
            r#"
string_fields = ["answer"]
array_fields = []

[classification]
field = "label"
allowed = ["keep", "drop"]
default = "keep"
"#,
        )
        .unwrap();
        let interpreter = ResponseInterpreter::new(schema);
        let ItemResult::Complete(result) = interpreter.parse(r#"{"label": "DROP", "answer": 42}"#)
        else {
            panic!("expected complete result");
        };
        assert_eq!(result.classification.as_deref(), Some("drop"));
        assert_eq!(result.string_field("answer"), Some("42"));
    }
}
