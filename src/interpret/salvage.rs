//! Best-effort field recovery from malformed or truncated JSON.
//!
//! Fields are located by their `"name":` key. A string value runs from its
//! opening quote to the last unescaped quote before the next known key; an
//! array value is decoded element by element, keeping only elements that
//! closed. Nothing is ever filled in: a field that cannot be recovered is
//! reported as missing.

use super::ResponseSchema;
use crate::models::{ItemResult, StructuredResult};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Located `"name":` key.
#[derive(Debug, Clone, Copy)]
struct KeyHit {
    /// Byte offset of the key's opening quote
    key_start: usize,
    /// Byte offset just past the colon
    value_start: usize,
}

/// Recover what can be recovered from `text`.
pub(super) fn salvage(text: &str, schema: &ResponseSchema) -> ItemResult {
    let names = schema.field_names();
    let hits: Vec<Option<KeyHit>> = names.iter().map(|name| locate_key(text, name)).collect();
    let boundaries: Vec<usize> = hits.iter().flatten().map(|h| h.key_start).collect();

    let next_boundary = |from: usize| {
        boundaries
            .iter()
            .copied()
            .filter(|&b| b > from)
            .min()
            .unwrap_or(text.len())
    };

    let mut result = StructuredResult::default();
    let mut missing = Vec::new();

    for (name, hit) in names.iter().zip(&hits) {
        let recovered = hit.and_then(|hit| {
            if is_array_field(schema, name) {
                extract_array(text, hit.value_start).map(Value::Array)
            } else {
                extract_string(text, hit.value_start, next_boundary(hit.value_start))
                    .map(Value::String)
            }
        });

        match recovered {
            Some(Value::String(label)) if *name == schema.classification.field => {
                result.classification = Some(schema.normalize_classification(&label));
            }
            Some(value) => {
                result.fields.insert(name.to_string(), value);
            }
            None => missing.push(name.to_string()),
        }
    }

    if result.is_empty() {
        return ItemResult::Unusable {
            reason: format!("No expected fields recoverable from reply ({} bytes)", text.len()),
        };
    }

    debug!(
        recovered = names.len() - missing.len(),
        missing = missing.len(),
        "Salvaged partial reply"
    );
    ItemResult::Salvaged { result, missing }
}

fn is_array_field(schema: &ResponseSchema, name: &str) -> bool {
    schema.array_fields.iter().any(|f| f == name)
}

fn locate_key(text: &str, name: &str) -> Option<KeyHit> {
    let re = Regex::new(&format!(r#""{}"\s*:"#, regex::escape(name))).ok()?;
    re.find(text).map(|m| KeyHit {
        key_start: m.start(),
        value_start: m.end(),
    })
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// String value starting at `value_start`, bounded by `boundary`.
///
/// Returns `None` when the value is not a string or has no closing quote.
fn extract_string(text: &str, value_start: usize, boundary: usize) -> Option<String> {
    let bytes = text.as_bytes();
    let open = skip_whitespace(bytes, value_start);
    if bytes.get(open) != Some(&b'"') {
        return None;
    }

    let limit = boundary.min(bytes.len());
    let mut close = None;
    let mut escaped = false;
    for (offset, &b) in bytes[open + 1..limit].iter().enumerate() {
        match b {
            b'\\' if !escaped => escaped = true,
            b'"' if !escaped => close = Some(open + 1 + offset),
            _ => escaped = false,
        }
    }

    close.map(|close| unescape(&text[open + 1..close]))
}

/// Array value starting at `value_start`.
///
/// Keeps every element that closed before the text ends; an unterminated
/// trailing element is dropped. Returns `None` if no element survived and the
/// array never closed.
fn extract_array(text: &str, value_start: usize) -> Option<Vec<Value>> {
    let bytes = text.as_bytes();
    let open = skip_whitespace(bytes, value_start);
    if bytes.get(open) != Some(&b'[') {
        return None;
    }

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut element_start = open + 1;
    let mut closed = false;

    for i in open + 1..bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' if depth > 0 => depth -= 1,
            b',' if depth == 0 => {
                if !push_element(&text[element_start..i], &mut items) {
                    break;
                }
                element_start = i + 1;
            }
            b']' => {
                closed = push_element(&text[element_start..i], &mut items);
                break;
            }
            // Enclosing object closed before the array did.
            b'}' => break,
            _ => {}
        }
    }

    (closed || !items.is_empty()).then_some(items)
}

/// Parse one complete element. Returns `false` if it is not valid JSON.
fn push_element(raw: &str, items: &mut Vec<Value>) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            items.push(value);
            true
        }
        Err(_) => false,
    }
}

/// Decode JSON string escapes, tolerating raw control characters and
/// malformed sequences (kept verbatim).
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match decode_unicode(&hex, &mut chars) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }

    out
}

/// Decode a `\uXXXX` escape, joining surrogate pairs.
fn decode_unicode(hex: &str, rest: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<char> {
    let high = u32::from_str_radix(hex, 16).ok().filter(|_| hex.len() == 4)?;
    if !(0xD800..0xDC00).contains(&high) {
        return char::from_u32(high);
    }

    let mut lookahead = rest.clone();
    if lookahead.next() != Some('\\') || lookahead.next() != Some('u') {
        return Some(char::REPLACEMENT_CHARACTER);
    }
    let low_hex: String = lookahead.by_ref().take(4).collect();
    let low = u32::from_str_radix(&low_hex, 16).ok()?;
    if !(0xDC00..0xE000).contains(&low) {
        return Some(char::REPLACEMENT_CHARACTER);
    }
    *rest = lookahead;
    char::from_u32(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00))
}
