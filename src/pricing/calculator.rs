use crate::error::{LedgerError, Result};
use crate::pricing::models::{round_cost, CostBreakdown, ModelPrice, PricingMissPolicy, PricingSource};
use tracing::warn;

const TOKENS_PER_PRICE_UNIT: f64 = 1_000_000.0;

/// Calculator for computing request costs based on token usage
#[derive(Debug, Clone, Copy, Default)]
pub struct CostCalculator {
    miss_policy: PricingMissPolicy,
}

impl CostCalculator {
    pub fn new(miss_policy: PricingMissPolicy) -> Self {
        Self { miss_policy }
    }

    pub fn miss_policy(&self) -> PricingMissPolicy {
        self.miss_policy
    }

    /// Strict cost computation: fails with `PricingMissing` when no price is known
    pub fn price(
        model: &str,
        price: Option<&ModelPrice>,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Result<CostBreakdown> {
        let price = price.ok_or_else(|| LedgerError::PricingMissing(model.to_string()))?;

        Ok(CostBreakdown::from_parts(
            (prompt_tokens as f64 / TOKENS_PER_PRICE_UNIT) * price.prompt_price_per_million,
            (completion_tokens as f64 / TOKENS_PER_PRICE_UNIT) * price.completion_price_per_million,
        ))
    }

    /// Calculate cost for a request, applying the miss policy when the model is unpriced
    pub fn calculate_cost(
        &self,
        model: &str,
        price: Option<&ModelPrice>,
        prompt_tokens: i64,
        completion_tokens: i64,
        reported_cost: Option<f64>,
    ) -> (CostBreakdown, PricingSource) {
        match Self::price(model, price, prompt_tokens, completion_tokens) {
            Ok(breakdown) => (breakdown, PricingSource::Priced),
            Err(e) => {
                warn!(model = %model, error = %e, policy = ?self.miss_policy, "Pricing miss");

                match (self.miss_policy, reported_cost) {
                    (PricingMissPolicy::CallerCost, Some(cost)) => (
                        split_reported_cost(cost, prompt_tokens, completion_tokens),
                        PricingSource::CallerReported,
                    ),
                    _ => (CostBreakdown::zero(), PricingSource::Unpriced),
                }
            }
        }
    }
}

/// Split a caller-reported total across prompt and completion by token share
///
/// The prompt share is rounded first and the completion share takes the
/// remainder, so the parts always add up to the rounded total.
fn split_reported_cost(total: f64, prompt_tokens: i64, completion_tokens: i64) -> CostBreakdown {
    let total = round_cost(total);
    let all_tokens = prompt_tokens + completion_tokens;

    let prompt_cost = if all_tokens > 0 {
        round_cost(total * prompt_tokens as f64 / all_tokens as f64)
    } else {
        0.0
    };
    let completion_cost = round_cost((total - prompt_cost).max(0.0));

    CostBreakdown {
        prompt_cost,
        completion_cost,
        total_cost: round_cost(prompt_cost + completion_cost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn haiku_price() -> ModelPrice {
        ModelPrice {
            model: "claude-3-haiku".to_string(),
            prompt_price_per_million: 0.25,
            completion_price_per_million: 1.25,
            updated_at: 0,
        }
    }

    #[test]
    fn test_cost_calculation_known_model() {
        let price = haiku_price();
        let (breakdown, source) = CostCalculator::default().calculate_cost(
            "claude-3-haiku",
            Some(&price),
            1000,
            500,
            None,
        );

        assert_eq!(source, PricingSource::Priced);
        assert_eq!(breakdown.prompt_cost, 0.00025);
        assert_eq!(breakdown.completion_cost, 0.000625);
        assert_eq!(breakdown.total_cost, 0.000875);
    }

    #[test]
    fn test_cost_calculation_one_million_tokens() {
        let price = ModelPrice {
            model: "gemini-pro".to_string(),
            prompt_price_per_million: 1.25,
            completion_price_per_million: 10.0,
            updated_at: 0,
        };

        let breakdown = CostCalculator::price("gemini-pro", Some(&price), 1_000_000, 1_000_000).unwrap();
        assert_eq!(breakdown.prompt_cost, 1.25);
        assert_eq!(breakdown.completion_cost, 10.0);
        assert_eq!(breakdown.total_cost, 11.25);
    }

    #[test]
    fn test_strict_price_reports_missing_model() {
        let err = CostCalculator::price("unknown-model", None, 10, 10).unwrap_err();
        assert!(matches!(err, LedgerError::PricingMissing(ref m) if m == "unknown-model"));
    }

    #[test]
    fn test_unknown_model_zero_cost_policy() {
        let calculator = CostCalculator::new(PricingMissPolicy::ZeroCost);
        let (breakdown, source) = calculator.calculate_cost("unknown-model", None, 1000, 1000, Some(0.5));

        assert_eq!(source, PricingSource::Unpriced);
        assert_eq!(breakdown, CostBreakdown::zero());
    }

    #[test]
    fn test_unknown_model_caller_cost_policy() {
        let calculator = CostCalculator::new(PricingMissPolicy::CallerCost);
        let (breakdown, source) = calculator.calculate_cost("unknown-model", None, 300, 100, Some(0.004));

        assert_eq!(source, PricingSource::CallerReported);
        assert_eq!(breakdown.prompt_cost, 0.003);
        assert_eq!(breakdown.completion_cost, 0.001);
        assert_eq!(breakdown.total_cost, 0.004);
    }

    #[test]
    fn test_caller_cost_policy_without_reported_cost() {
        let calculator = CostCalculator::new(PricingMissPolicy::CallerCost);
        let (breakdown, source) = calculator.calculate_cost("unknown-model", None, 300, 100, None);

        assert_eq!(source, PricingSource::Unpriced);
        assert_eq!(breakdown.total_cost, 0.0);
    }

    #[test]
    fn test_split_reported_cost_with_no_tokens() {
        let breakdown = split_reported_cost(0.01, 0, 0);
        assert_eq!(breakdown.prompt_cost, 0.0);
        assert_eq!(breakdown.completion_cost, 0.01);
        assert_eq!(breakdown.total_cost, 0.01);
    }
}
