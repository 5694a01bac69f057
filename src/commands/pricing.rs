use anyhow::Result;
use chrono::{TimeZone, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use std::path::Path;
use tracing::info;
use usage_ledger::pricing::{load_pricing_file, ModelPrice};

use crate::cli::PricingCommands;

/// Execute a pricing subcommand
pub async fn execute(config_path: &Path, action: PricingCommands) -> Result<()> {
    let ledger = super::open_ledger(config_path).await?;

    match action {
        PricingCommands::Set { model, prompt, completion } => {
            let price = ledger.set_price(&model, prompt, completion).await?;
            println!(
                "Set {}: ${} prompt, ${} completion per million tokens",
                price.model, price.prompt_price_per_million, price.completion_price_per_million
            );
        }
        PricingCommands::List => {
            let prices = ledger.list_prices().await?;
            print!("{}", render_prices(&prices));
        }
        PricingCommands::Import { file } => {
            let prices = load_pricing_file(&file)?;
            let count = ledger.import_prices(&prices).await?;
            info!(file = %file.display(), count, "Pricing imported");
            println!("Imported {} model prices from {}", count, file.display());
        }
    }

    ledger.close().await;
    Ok(())
}

fn render_prices(prices: &[ModelPrice]) -> String {
    if prices.is_empty() {
        return "Model Pricing: No prices configured\n".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("MODEL").fg(Color::Cyan),
        Cell::new("PROMPT / 1M").fg(Color::Cyan),
        Cell::new("COMPLETION / 1M").fg(Color::Cyan),
        Cell::new("UPDATED").fg(Color::Cyan),
    ]);

    for price in prices {
        let updated = Utc
            .timestamp_millis_opt(price.updated_at)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&price.model),
            Cell::new(format!("${}", price.prompt_price_per_million)),
            Cell::new(format!("${}", price.completion_price_per_million)),
            Cell::new(updated),
        ]);
    }

    format!("Model Pricing:\n{}\n", table)
}
