//! Work items and the ordered source they come from.

use super::{Result, TollgateError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// One unit of work.
///
/// Immutable once enumerated; `index` fixes its position in every output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, unique within a source
    pub id: String,

    /// Ordinal position in the source
    #[serde(default)]
    pub index: usize,

    /// Opaque domain payload handed to the request builder
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Line format accepted in item files.
#[derive(Debug, Deserialize)]
struct ItemLine {
    id: serde_json::Value,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Ordered, immutable collection of items.
#[derive(Debug, Clone, Default)]
pub struct ItemSource {
    items: Vec<Item>,
}

impl ItemSource {
    /// Build a source from `(id, payload)` pairs, assigning ordinals.
    ///
    /// Fails on duplicate ids: resume and snapshot lookups are keyed by id.
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, serde_json::Value)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for (index, (id, payload)) in entries.into_iter().enumerate() {
            let id = id.into();
            if !seen.insert(id.clone()) {
                return Err(TollgateError::DuplicateItemId(id));
            }
            items.push(Item { id, index, payload });
        }
        Ok(Self { items })
    }

    /// Load items from a JSONL file: one `{"id": ..., "payload": ...}` per line.
    ///
    /// Numeric ids are accepted and stringified. Blank lines are ignored.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TollgateError::io("opening items file", e))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| TollgateError::io("reading items file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ItemLine = serde_json::from_str(&line).map_err(|e| {
                TollgateError::ParseError(format!("Items line {}: {}", line_num + 1, e))
            })?;
            let id = match parsed.id {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(TollgateError::ParseError(format!(
                        "Items line {}: id must be a string or number, got {other}",
                        line_num + 1
                    )));
                }
            };
            entries.push((id, parsed.payload));
        }

        let source = Self::new(entries)?;
        info!(count = source.len(), path = %path.display(), "Loaded items");
        Ok(source)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a> IntoIterator for &'a ItemSource {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
