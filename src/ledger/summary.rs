use serde::Serialize;
use sqlx::FromRow;
use std::cmp::Ordering;

use crate::ledger::period::Period;
use crate::pricing::round_cost;

/// Per-model totals inside a summary
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ModelUsage {
    pub model: String,
    pub total_requests: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

impl ModelUsage {
    pub fn empty(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            total_requests: 0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }

    /// Fold one request into these totals
    ///
    /// Counters saturate at `i64::MAX` rather than wrapping.
    pub fn add_request(&mut self, prompt_tokens: i64, completion_tokens: i64, cost: f64) {
        self.total_requests = self.total_requests.saturating_add(1);
        self.total_prompt_tokens = self.total_prompt_tokens.saturating_add(prompt_tokens);
        self.total_completion_tokens = self.total_completion_tokens.saturating_add(completion_tokens);
        self.total_tokens = self
            .total_tokens
            .saturating_add(prompt_tokens.saturating_add(completion_tokens));
        self.total_cost += cost;
    }

    /// Fold another set of totals for the same model into these
    pub fn merge(&mut self, other: &ModelUsage) {
        self.total_requests = self.total_requests.saturating_add(other.total_requests);
        self.total_prompt_tokens = self.total_prompt_tokens.saturating_add(other.total_prompt_tokens);
        self.total_completion_tokens = self
            .total_completion_tokens
            .saturating_add(other.total_completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.total_cost += other.total_cost;
    }
}

/// Most expensive model first; model name breaks ties
pub fn by_cost_desc(a: &ModelUsage, b: &ModelUsage) -> Ordering {
    b.total_cost
        .partial_cmp(&a.total_cost)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.model.cmp(&b.model))
}

/// Aggregated usage for a period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub period: Period,
    pub total_requests: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    /// Ordered by total cost, descending
    pub by_model: Vec<ModelUsage>,
}

impl UsageSummary {
    pub fn empty(period: Period) -> Self {
        Self {
            period,
            total_requests: 0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
            by_model: Vec::new(),
        }
    }

    /// Build a summary from per-model rows, deriving the grand totals
    pub fn from_models(period: Period, mut by_model: Vec<ModelUsage>) -> Self {
        for row in &mut by_model {
            row.total_cost = round_cost(row.total_cost);
        }
        by_model.sort_by(by_cost_desc);

        let mut totals = ModelUsage::empty("");
        for row in &by_model {
            totals.merge(row);
        }

        Self {
            period,
            total_requests: totals.total_requests,
            total_prompt_tokens: totals.total_prompt_tokens,
            total_completion_tokens: totals.total_completion_tokens,
            total_tokens: totals.total_tokens,
            total_cost: round_cost(totals.total_cost),
            by_model,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_requests == 0
    }

    /// Combine two summaries of the same period (e.g. ledger + in-memory fallback)
    pub fn merged_with(&self, other: &UsageSummary) -> UsageSummary {
        let mut rows = self.by_model.clone();
        for extra in &other.by_model {
            match rows.iter_mut().find(|r| r.model == extra.model) {
                Some(existing) => existing.merge(extra),
                None => rows.push(extra.clone()),
            }
        }
        UsageSummary::from_models(self.period, rows)
    }
}
