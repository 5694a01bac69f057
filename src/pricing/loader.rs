use crate::error::{LedgerError, Result};
use crate::pricing::models::ModelPrice;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Pricing file structure
///
/// ```toml
/// [models."claude-3-haiku"]
/// prompt = 0.25
/// completion = 1.25
/// ```
#[derive(Debug, Deserialize)]
pub struct PricingDataFile {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPriceData>,
}

/// Individual model pricing data, USD per 1M tokens
#[derive(Debug, Deserialize)]
pub struct ModelPriceData {
    pub prompt: f64,
    pub completion: f64,
}

/// Parse a pricing TOML document into a price list ordered by model name
pub fn parse_pricing_toml(content: &str) -> Result<Vec<ModelPrice>> {
    let data: PricingDataFile = toml::from_str(content)
        .map_err(|e| LedgerError::InvalidInput(format!("Failed to parse pricing file: {}", e)))?;

    let prices: Vec<ModelPrice> = data
        .models
        .into_iter()
        .map(|(model, price)| ModelPrice {
            model,
            prompt_price_per_million: price.prompt,
            completion_price_per_million: price.completion,
            updated_at: 0,
        })
        .collect();

    info!("Parsed {} model prices", prices.len());
    Ok(prices)
}

/// Read and parse a pricing file from disk
pub fn load_pricing_file(path: &Path) -> Result<Vec<ModelPrice>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        LedgerError::Config(format!("Failed to read pricing file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), bytes = content.len(), "Loaded pricing file");
    parse_pricing_toml(&content)
}
