//! Checkpoint records and interpreted results.
//!
//! A record is written once per processing attempt and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Outcome of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Reply parsed cleanly
    Success,
    /// Reply was malformed; fields were partially recovered
    Salvaged,
    /// Provider call failed
    Failed,
    /// No call was made
    Skipped,
}

impl OutcomeStatus {
    /// Whether a resumed run should leave this item alone.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether this outcome is only retried on explicit request.
    pub fn needs_explicit_retry(&self) -> bool {
        matches!(self, Self::Failed | Self::Salvaged)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "success"),
            OutcomeStatus::Salvaged => write!(f, "salvaged"),
            OutcomeStatus::Failed => write!(f, "failed"),
            OutcomeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why an item was skipped without a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    /// The call would have exceeded the budget ceiling
    Budget,
    /// The request exceeded the per-call size limit
    Oversize,
}

/// Structured fields extracted from a provider reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    /// Normalized classification value (always one of the allowed set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,

    /// Remaining schema fields, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

impl StructuredResult {
    pub fn is_empty(&self) -> bool {
        self.classification.is_none() && self.fields.is_empty()
    }

    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn array_field(&self, name: &str) -> Option<&Vec<Value>> {
        self.fields.get(name).and_then(Value::as_array)
    }
}

/// Interpreted reply.
///
/// Partial recovery is its own variant so that a salvaged result can never be
/// consumed as a trustworthy one by accident.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    /// Strict parse succeeded
    Complete(StructuredResult),
    /// Strict parse failed; some fields were recovered
    Salvaged {
        result: StructuredResult,
        missing: Vec<String>,
    },
    /// Nothing could be recovered
    Unusable { reason: String },
}

impl ItemResult {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            ItemResult::Complete(_) => OutcomeStatus::Success,
            ItemResult::Salvaged { .. } | ItemResult::Unusable { .. } => OutcomeStatus::Salvaged,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ItemResult::Complete(_))
    }
}

/// One durable line in the checkpoint log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Item id
    pub id: String,

    /// Run that wrote this record
    pub run_id: String,

    /// Outcome of this attempt
    pub status: OutcomeStatus,

    /// Extracted fields (success and salvaged outcomes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StructuredResult>,

    /// Schema fields salvage could not locate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,

    /// Set when a human should look at this item
    #[serde(default)]
    pub needs_review: bool,

    /// Raw provider text, kept for forensic salvage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,

    /// Error description for failed or unusable attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Reason for a skipped outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    /// Provider-reported usage, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Cost charged for this attempt in USD
    #[serde(default)]
    pub cost_usd: f64,

    /// HTTP requests made for this attempt
    #[serde(default)]
    pub attempts: u32,

    /// When the record was written
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    fn base(id: &str, run_id: &str, status: OutcomeStatus) -> Self {
        Self {
            id: id.to_string(),
            run_id: run_id.to_string(),
            status,
            result: None,
            missing_fields: Vec::new(),
            needs_review: false,
            raw_response: None,
            error: None,
            skip_reason: None,
            usage: None,
            cost_usd: 0.0,
            attempts: 0,
            timestamp: Utc::now(),
        }
    }

    /// Record for an interpreted reply.
    pub fn interpreted(
        id: &str,
        run_id: &str,
        interpreted: ItemResult,
        raw_response: String,
        usage: Option<Usage>,
        cost_usd: f64,
        attempts: u32,
    ) -> Self {
        let mut record = Self::base(id, run_id, interpreted.status());
        match interpreted {
            ItemResult::Complete(result) => {
                record.result = Some(result);
            }
            ItemResult::Salvaged { result, missing } => {
                record.result = Some(result);
                record.missing_fields = missing;
                record.needs_review = true;
            }
            ItemResult::Unusable { reason } => {
                record.error = Some(reason);
                record.needs_review = true;
            }
        }
        record.raw_response = Some(raw_response);
        record.usage = usage;
        record.cost_usd = cost_usd;
        record.attempts = attempts;
        record
    }

    /// Record for a provider call that failed terminally.
    pub fn failed(
        id: &str,
        run_id: &str,
        error: String,
        usage: Option<Usage>,
        cost_usd: f64,
        attempts: u32,
    ) -> Self {
        let mut record = Self::base(id, run_id, OutcomeStatus::Failed);
        record.error = Some(error);
        record.usage = usage;
        record.cost_usd = cost_usd;
        record.attempts = attempts;
        record
    }

    /// Record for an item that was not sent.
    pub fn skipped(id: &str, run_id: &str, reason: SkipReason) -> Self {
        let mut record = Self::base(id, run_id, OutcomeStatus::Skipped);
        record.skip_reason = Some(reason);
        record
    }
}
