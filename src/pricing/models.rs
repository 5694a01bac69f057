use serde::{Deserialize, Serialize};

/// Number of fractional digits kept for every persisted cost
pub const COST_SCALE: i32 = 6;

/// Round a cost to the persisted precision (6 fractional digits)
pub fn round_cost(value: f64) -> f64 {
    let factor = 10f64.powi(COST_SCALE);
    (value * factor).round() / factor
}

/// Model pricing information (prices are per 1M tokens)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub prompt_price_per_million: f64,
    pub completion_price_per_million: f64,
    /// Unix milliseconds of the last update
    pub updated_at: i64,
}

/// Cost breakdown for a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    /// Create a zero-cost breakdown
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build from component costs, rounding each and deriving the total
    pub fn from_parts(prompt_cost: f64, completion_cost: f64) -> Self {
        let prompt_cost = round_cost(prompt_cost);
        let completion_cost = round_cost(completion_cost);
        Self {
            prompt_cost,
            completion_cost,
            total_cost: round_cost(prompt_cost + completion_cost),
        }
    }
}

/// How the costs of a record were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    /// Computed from the model_pricing table
    Priced,
    /// No pricing row; tokens persisted with the caller-reported cost
    CallerReported,
    /// No pricing row; tokens persisted with zero cost
    Unpriced,
}

/// Behavior when a model has no pricing row at write time
///
/// A pricing miss never fails `record()`; the record is always persisted with
/// its token counts and the receipt reports which path was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMissPolicy {
    /// Persist with zero cost (`PricingSource::Unpriced`)
    #[default]
    ZeroCost,
    /// Use the cost the caller reported (e.g. from the provider response),
    /// falling back to zero when none was reported
    CallerCost,
}
