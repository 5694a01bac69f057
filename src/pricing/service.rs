use crate::error::{LedgerError, Result};
use crate::pricing::models::ModelPrice;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::info;

type PriceRow = (String, f64, f64, i64);

fn into_price((model, prompt_price_per_million, completion_price_per_million, updated_at): PriceRow) -> ModelPrice {
    ModelPrice {
        model,
        prompt_price_per_million,
        completion_price_per_million,
        updated_at,
    }
}

/// Service for managing model pricing data
///
/// Lookups always read the `model_pricing` table so that a price change made
/// by another process is picked up by the very next write.
#[derive(Clone)]
pub struct PricingService {
    db_pool: SqlitePool,
}

impl PricingService {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    /// Look up a model's price on any executor (pool, connection or open transaction)
    ///
    /// Model names match case-sensitively.
    pub async fn lookup<'e, E>(executor: E, model: &str) -> Result<Option<ModelPrice>>
    where
        E: SqliteExecutor<'e>,
    {
        let row = sqlx::query_as::<_, PriceRow>(
            r#"
            SELECT model, prompt_price_per_million, completion_price_per_million, updated_at
            FROM model_pricing
            WHERE model = ?
            "#,
        )
        .bind(model)
        .fetch_optional(executor)
        .await?;

        Ok(row.map(into_price))
    }

    /// Get pricing for a specific model
    pub async fn get_model_price(&self, model: &str) -> Result<Option<ModelPrice>> {
        Self::lookup(&self.db_pool, model).await
    }

    /// List all pricing data, ordered by model name
    pub async fn list_all_prices(&self) -> Result<Vec<ModelPrice>> {
        let rows = sqlx::query_as::<_, PriceRow>(
            r#"
            SELECT model, prompt_price_per_million, completion_price_per_million, updated_at
            FROM model_pricing
            ORDER BY model
            "#,
        )
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows.into_iter().map(into_price).collect())
    }

    /// Insert or update a model price
    pub async fn upsert_model_price(
        &self,
        model: &str,
        prompt_price_per_million: f64,
        completion_price_per_million: f64,
    ) -> Result<ModelPrice> {
        validate_price(model, prompt_price_per_million, completion_price_per_million)?;

        let updated_at = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO model_pricing (
                model, prompt_price_per_million, completion_price_per_million, updated_at
            )
            VALUES (?, ?, ?, ?)
            ON CONFLICT(model) DO UPDATE SET
                prompt_price_per_million = excluded.prompt_price_per_million,
                completion_price_per_million = excluded.completion_price_per_million,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(model)
        .bind(prompt_price_per_million)
        .bind(completion_price_per_million)
        .bind(updated_at)
        .execute(&self.db_pool)
        .await?;

        Ok(ModelPrice {
            model: model.to_string(),
            prompt_price_per_million,
            completion_price_per_million,
            updated_at,
        })
    }

    /// Upsert many prices in one transaction
    pub async fn import_prices(&self, prices: &[ModelPrice]) -> Result<usize> {
        for price in prices {
            validate_price(
                &price.model,
                price.prompt_price_per_million,
                price.completion_price_per_million,
            )?;
        }

        let updated_at = chrono::Utc::now().timestamp_millis();
        let mut tx = self.db_pool.begin().await?;

        for price in prices {
            sqlx::query(
                r#"
                INSERT INTO model_pricing (
                    model, prompt_price_per_million, completion_price_per_million, updated_at
                )
                VALUES (?, ?, ?, ?)
                ON CONFLICT(model) DO UPDATE SET
                    prompt_price_per_million = excluded.prompt_price_per_million,
                    completion_price_per_million = excluded.completion_price_per_million,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&price.model)
            .bind(price.prompt_price_per_million)
            .bind(price.completion_price_per_million)
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!("Imported {} model prices", prices.len());
        Ok(prices.len())
    }
}

fn validate_price(model: &str, prompt: f64, completion: f64) -> Result<()> {
    if model.trim().is_empty() {
        return Err(LedgerError::InvalidInput("model name cannot be empty".to_string()));
    }
    for (label, value) in [("prompt", prompt), ("completion", completion)] {
        if !value.is_finite() || value < 0.0 {
            return Err(LedgerError::InvalidInput(format!(
                "{} price for '{}' must be a non-negative number, got {}",
                label, model, value
            )));
        }
    }
    Ok(())
}
