//! Budget module - cost estimation and the spend ceiling.
//!
//! One `BudgetTracker` is built per run and handed to the controller; there is
//! no process-wide counter. Totals are only mutated after a call completes.
//!
//! Accounting policy:
//! - Completed calls are charged provider-reported usage, or the pre-call
//!   estimate when the provider reports none.
//! - Failed calls are charged only for usage the provider reported.
//! - Skipped items are never charged.

use crate::client::ChatRequest;
use crate::models::{PricingConfig, Usage};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tolerance for floating-point comparisons against the ceiling.
const CEILING_EPSILON: f64 = 1e-9;

/// Running totals for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Conservative pre-call estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Cost accumulator with a hard ceiling.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    pricing: PricingConfig,
    ceiling_usd: Option<f64>,
    state: BudgetState,
}

impl BudgetTracker {
    /// Create a tracker with zeroed totals.
    pub fn new(pricing: PricingConfig, ceiling_usd: Option<f64>) -> Self {
        Self {
            pricing,
            ceiling_usd,
            state: BudgetState::default(),
        }
    }

    /// Seed totals with spend already recorded by earlier runs.
    pub fn resume_from(&mut self, spent: &BudgetState) {
        self.state = spent.clone();
        debug!(
            cost_usd = self.state.cost_usd,
            requests = self.state.requests,
            "Budget resumed from checkpoint"
        );
    }

    /// Price a usage figure.
    pub fn price(&self, usage: &Usage) -> f64 {
        let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * self.pricing.input_price_per_1m;
        let output_cost =
            (usage.output_tokens as f64 / 1_000_000.0) * self.pricing.output_price_per_1m;
        input_cost + output_cost
    }

    /// Estimate the cost of a request before sending it.
    ///
    /// Input is sized from prompt characters (rounded up); output assumes the
    /// larger of the configured expectation and the request's token cap.
    pub fn estimate(&self, request: &ChatRequest) -> CostEstimate {
        let chars = request.prompt_chars() as f64;
        let input_tokens = (chars / self.pricing.chars_per_token).ceil() as u64;
        let output_tokens = self
            .pricing
            .expected_output_tokens
            .unwrap_or(0)
            .max(u64::from(request.max_tokens));
        let cost_usd = self.price(&Usage::new(input_tokens, output_tokens));

        CostEstimate {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }

    /// Gate check: would this call push spend past the ceiling?
    pub fn will_exceed(&self, estimate: &CostEstimate) -> bool {
        match self.ceiling_usd {
            Some(ceiling) => self.state.cost_usd + estimate.cost_usd > ceiling + CEILING_EPSILON,
            None => false,
        }
    }

    /// Charge a completed call. Returns the amount charged.
    pub fn record_actual(
        &mut self,
        usage: Option<Usage>,
        estimate: &CostEstimate,
        attempts: u32,
    ) -> f64 {
        let (usage, cost) = match usage {
            Some(usage) => (usage, self.price(&usage)),
            None => (
                Usage::new(estimate.input_tokens, estimate.output_tokens),
                estimate.cost_usd,
            ),
        };
        self.charge(usage, cost, attempts);
        cost
    }

    /// Charge a failed call. Returns the amount charged.
    pub fn record_failure(&mut self, usage: Option<Usage>, attempts: u32) -> f64 {
        let usage = usage.unwrap_or_default();
        let cost = self.price(&usage);
        self.charge(usage, cost, attempts);
        cost
    }

    fn charge(&mut self, usage: Usage, cost: f64, attempts: u32) {
        self.state.requests += u64::from(attempts);
        self.state.input_tokens += usage.input_tokens;
        self.state.output_tokens += usage.output_tokens;
        self.state.cost_usd += cost;
    }

    pub fn state(&self) -> &BudgetState {
        &self.state
    }

    pub fn ceiling_usd(&self) -> Option<f64> {
        self.ceiling_usd
    }

    /// Spend left under the ceiling, if there is one.
    pub fn remaining_usd(&self) -> Option<f64> {
        self.ceiling_usd
            .map(|ceiling| (ceiling - self.state.cost_usd).max(0.0))
    }
}
