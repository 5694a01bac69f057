//! Usage ledger
//!
//! Owns `usage_records` and the two summary tables derived from it. Every
//! `record()` prices the event, then runs one transaction: raw insert, daily
//! upsert, monthly upsert, commit. A timeout or error anywhere rolls the whole unit
//! back, so readers never see a record without its aggregates or vice versa.

pub mod aggregate;
pub mod event;
pub mod period;
pub mod summary;

pub use aggregate::{AggregateMismatch, AggregateTable, ConsistencyReport, RepairStats};
pub use event::{Metadata, RecordId, RecordReceipt, UsageEvent, UsageRecord};
pub use period::Period;
pub use summary::{ModelUsage, UsageSummary};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LedgerConfig};
use crate::error::{LedgerError, Result};
use crate::pricing::{CostCalculator, ModelPrice, PricingMissPolicy, PricingService};
use crate::store;
use crate::time::ReferenceZone;
use aggregate::Increment;

/// Default number of rows returned by `recent()`
pub const DEFAULT_RECENT_LIMIT: u32 = 20;

/// Runtime settings derived from `LedgerConfig`
#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    pub zone: ReferenceZone,
    pub record_timeout: Duration,
    pub pricing_miss: PricingMissPolicy,
    pub consistency_tolerance: f64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            zone: ReferenceZone::utc(),
            record_timeout: Duration::from_millis(2000),
            pricing_miss: PricingMissPolicy::ZeroCost,
            consistency_tolerance: 1e-6,
        }
    }
}

impl LedgerSettings {
    pub fn from_config(cfg: &LedgerConfig) -> Result<Self> {
        let zone = cfg
            .timezone
            .parse::<ReferenceZone>()
            .map_err(LedgerError::Config)?;

        Ok(Self {
            zone,
            record_timeout: Duration::from_millis(cfg.record_timeout_ms),
            pricing_miss: cfg.pricing_miss,
            consistency_tolerance: cfg.consistency_tolerance,
        })
    }
}

/// Caller-facing surface of the ledger
///
/// The bridging server depends on this trait rather than on `Ledger`, so its
/// degraded mode can be exercised without a database.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Persist one completed request
    async fn record(&self, event: UsageEvent) -> Result<RecordReceipt>;

    /// Aggregate usage for a period, optionally narrowed to one model
    async fn query(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<UsageSummary>;
}

/// The usage ledger
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    pricing: PricingService,
    calculator: CostCalculator,
    settings: LedgerSettings,
}

impl Ledger {
    /// Wrap an already-migrated pool
    pub fn new(pool: SqlitePool, settings: LedgerSettings) -> Self {
        Self {
            pricing: PricingService::new(pool.clone()),
            calculator: CostCalculator::new(settings.pricing_miss),
            pool,
            settings,
        }
    }

    /// Connect to the configured store, run migrations and build the ledger
    pub async fn open(cfg: &Config) -> Result<Self> {
        let settings = LedgerSettings::from_config(&cfg.ledger)?;
        let pool = store::connect(&cfg.store, settings.record_timeout).await?;

        info!(
            database = %cfg.store.database_url,
            timezone = %settings.zone,
            pricing_miss = ?settings.pricing_miss,
            "Usage ledger opened"
        );

        Ok(Self::new(pool, settings))
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn pricing(&self) -> &PricingService {
        &self.pricing
    }

    /// Close the pool; every later call fails with `StoreUnavailable`
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.record_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    operation,
                    timeout_ms = self.settings.record_timeout.as_millis() as u64,
                    "Store operation timed out"
                );
                Err(LedgerError::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.settings.record_timeout
                )))
            }
        }
    }

    /// Record a completed request stamped with the current time
    pub async fn record(&self, event: UsageEvent) -> Result<RecordReceipt> {
        self.record_at(event, Utc::now()).await
    }

    /// Record a completed request with an explicit creation instant
    pub async fn record_at(&self, event: UsageEvent, created_at: DateTime<Utc>) -> Result<RecordReceipt> {
        event.validate()?;

        let result = self.write_record(&event, created_at).await;

        match &result {
            Ok(receipt) => debug!(
                id = %receipt.id,
                model = %event.model,
                session_id = %event.session_id,
                total_tokens = receipt.total_tokens,
                total_cost = receipt.costs.total_cost,
                "Usage recorded"
            ),
            Err(e) => error!(
                model = %event.model,
                session_id = %event.session_id,
                error = %e,
                kind = e.kind(),
                "Failed to record usage"
            ),
        }

        result
    }

    /// Stage under the timeout, then commit outside it
    ///
    /// Once the three statements have run the write lock is held, so COMMIT
    /// cannot wait on another writer. Bounding it would allow a commit that
    /// lands after the caller was told the record failed.
    async fn write_record(&self, event: &UsageEvent, created_at: DateTime<Utc>) -> Result<RecordReceipt> {
        let (tx, receipt) = self
            .bounded("record", self.stage_record(event, created_at))
            .await?;
        tx.commit().await?;
        Ok(receipt)
    }

    /// Run the record's writes in an open transaction without committing it
    pub(crate) async fn stage_record(
        &self,
        event: &UsageEvent,
        created_at: DateTime<Utc>,
    ) -> Result<(Transaction<'static, Sqlite>, RecordReceipt)> {
        let zone = self.settings.zone;
        let id = RecordId::generate();
        let total_tokens = event.total_tokens();
        let metadata = event
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        // Price is read before BEGIN so the first statement in the
        // transaction is a write; a read-then-write upgrade in WAL mode can
        // fail with SQLITE_BUSY instead of waiting on the busy timeout.
        let price = PricingService::lookup(&self.pool, &event.model).await?;
        let (costs, pricing) = self.calculator.calculate_cost(
            &event.model,
            price.as_ref(),
            event.prompt_tokens,
            event.completion_tokens,
            event.reported_cost,
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO usage_records (
                id, created_at, model, prompt_tokens, completion_tokens, total_tokens,
                prompt_cost, completion_cost, total_cost, request_type, session_id,
                user_id, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(id.as_str())
        .bind(created_at.timestamp_millis())
        .bind(&event.model)
        .bind(event.prompt_tokens)
        .bind(event.completion_tokens)
        .bind(total_tokens)
        .bind(costs.prompt_cost)
        .bind(costs.completion_cost)
        .bind(costs.total_cost)
        .bind(&event.request_type)
        .bind(&event.session_id)
        .bind(&event.user_id)
        .bind(&metadata)
        .execute(&mut *tx)
        .await?;

        let inc = Increment {
            prompt_tokens: event.prompt_tokens,
            completion_tokens: event.completion_tokens,
            total_tokens,
            total_cost: costs.total_cost,
        };
        aggregate::increment_daily(&mut tx, zone.date_of(created_at), &event.model, inc).await?;
        aggregate::increment_monthly(&mut tx, zone.month_of(created_at), &event.model, inc).await?;

        let receipt = RecordReceipt {
            id,
            created_at,
            total_tokens,
            costs,
            pricing,
        };
        Ok((tx, receipt))
    }

    /// Aggregate usage for a period as of now
    pub async fn query(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<UsageSummary> {
        self.query_at(period, model, session_id, Utc::now()).await
    }

    /// Aggregate usage for a period as of `now`
    ///
    /// `all`, `today`, `month` and ranges read the summary tables only;
    /// `session` scans the raw records of that session.
    pub async fn query_at(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary> {
        let rows = self
            .bounded("query", self.fetch_summary_rows(period, model, session_id, now))
            .await?;
        Ok(UsageSummary::from_models(period, rows))
    }

    async fn fetch_summary_rows(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ModelUsage>> {
        const SUMMED: &str = "model,
                SUM(total_requests) AS total_requests,
                SUM(total_prompt_tokens) AS total_prompt_tokens,
                SUM(total_completion_tokens) AS total_completion_tokens,
                SUM(total_tokens) AS total_tokens,
                SUM(total_cost) AS total_cost";

        let zone = self.settings.zone;

        let rows = match period {
            Period::All => {
                let sql = format!(
                    "SELECT {} FROM monthly_usage_summary WHERE ?1 IS NULL OR model = ?1 GROUP BY model",
                    SUMMED
                );
                sqlx::query_as::<_, ModelUsage>(&sql)
                    .bind(model)
                    .fetch_all(&self.pool)
                    .await?
            }
            Period::Today => {
                let today = zone.date_of(now);
                self.fetch_daily(today, today, model).await?
            }
            Period::Range { start, end } => self.fetch_daily(start, end, model).await?,
            Period::Month => {
                let month = zone.month_of(now);
                let sql = format!(
                    "SELECT {} FROM monthly_usage_summary \
                     WHERE year = ?1 AND month = ?2 AND (?3 IS NULL OR model = ?3) GROUP BY model",
                    SUMMED
                );
                sqlx::query_as::<_, ModelUsage>(&sql)
                    .bind(month.year)
                    .bind(month.month as i64)
                    .bind(model)
                    .fetch_all(&self.pool)
                    .await?
            }
            Period::Session => {
                let session_id = session_id.ok_or_else(|| {
                    LedgerError::InvalidInput("period 'session' requires a session id".to_string())
                })?;
                sqlx::query_as::<_, ModelUsage>(
                    r#"
                    SELECT model,
                        COUNT(*) AS total_requests,
                        SUM(prompt_tokens) AS total_prompt_tokens,
                        SUM(completion_tokens) AS total_completion_tokens,
                        SUM(total_tokens) AS total_tokens,
                        SUM(total_cost) AS total_cost
                    FROM usage_records
                    WHERE session_id = ?1 AND (?2 IS NULL OR model = ?2)
                    GROUP BY model
                    "#,
                )
                .bind(session_id)
                .bind(model)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    async fn fetch_daily(&self, first: NaiveDate, last: NaiveDate, model: Option<&str>) -> Result<Vec<ModelUsage>> {
        let rows = sqlx::query_as::<_, ModelUsage>(
            r#"
            SELECT model,
                SUM(total_requests) AS total_requests,
                SUM(total_prompt_tokens) AS total_prompt_tokens,
                SUM(total_completion_tokens) AS total_completion_tokens,
                SUM(total_tokens) AS total_tokens,
                SUM(total_cost) AS total_cost
            FROM daily_usage_summary
            WHERE date BETWEEN ?1 AND ?2 AND (?3 IS NULL OR model = ?3)
            GROUP BY model
            "#,
        )
        .bind(first.format("%Y-%m-%d").to_string())
        .bind(last.format("%Y-%m-%d").to_string())
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Newest raw records first, for a detailed history view
    pub async fn recent(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<UsageRecord>> {
        self.recent_at(period, model, session_id, limit, Utc::now()).await
    }

    pub async fn recent_at(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let zone = self.settings.zone;

        let (from_ms, to_ms, session) = match period {
            Period::All => (None, None, None),
            Period::Today => {
                let today = zone.date_of(now);
                let (start, end) = zone.utc_range(today, today);
                (Some(start.timestamp_millis()), Some(end.timestamp_millis()), None)
            }
            Period::Month => {
                let (start, end) = zone.month_range(zone.month_of(now));
                (Some(start.timestamp_millis()), Some(end.timestamp_millis()), None)
            }
            Period::Range { start, end } => {
                let (start, end) = zone.utc_range(start, end);
                (Some(start.timestamp_millis()), Some(end.timestamp_millis()), None)
            }
            Period::Session => {
                let session_id = session_id.ok_or_else(|| {
                    LedgerError::InvalidInput("period 'session' requires a session id".to_string())
                })?;
                (None, None, Some(session_id))
            }
        };

        let fut = async {
            let records = sqlx::query_as::<_, UsageRecord>(
                r#"
                SELECT id, created_at, model, prompt_tokens, completion_tokens, total_tokens,
                       prompt_cost, completion_cost, total_cost, request_type, session_id,
                       user_id, metadata
                FROM usage_records
                WHERE (?1 IS NULL OR created_at >= ?1)
                  AND (?2 IS NULL OR created_at < ?2)
                  AND (?3 IS NULL OR session_id = ?3)
                  AND (?4 IS NULL OR model = ?4)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?5
                "#,
            )
            .bind(from_ms)
            .bind(to_ms)
            .bind(session)
            .bind(model)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok::<_, LedgerError>(records)
        };

        self.bounded("recent", fut).await
    }

    /// Compare summary tables against a derivation from raw records
    pub async fn verify(&self) -> Result<ConsistencyReport> {
        let zone = self.settings.zone;
        let (stored, recomputed) = self
            .bounded("verify", async {
                // One read transaction so both sides see the same snapshot
                let mut tx = self.pool.begin().await?;
                let stored = aggregate::load_stored(&mut tx).await?;
                let recomputed = aggregate::recompute(&mut tx, zone).await?;
                tx.commit().await?;
                Ok::<_, LedgerError>((stored, recomputed))
            })
            .await?;

        let report = aggregate::compare(&stored, &recomputed, self.settings.consistency_tolerance);

        if !report.is_consistent() {
            warn!(
                mismatches = report.mismatches.len(),
                records = report.records_scanned,
                "Aggregate tables disagree with raw records"
            );
        }

        Ok(report)
    }

    /// Like `verify`, but an inconsistency is an error
    pub async fn ensure_consistent(&self) -> Result<ConsistencyReport> {
        let report = self.verify().await?;
        if report.is_consistent() {
            Ok(report)
        } else {
            Err(LedgerError::AggregateInconsistency {
                mismatches: report.mismatches.len(),
            })
        }
    }

    /// Rebuild both summary tables from raw records in one transaction
    pub async fn repair(&self) -> Result<RepairStats> {
        let zone = self.settings.zone;
        let (tx, stats) = self
            .bounded("repair", async {
                let mut tx = self.pool.begin().await?;
                let stats = aggregate::rebuild(&mut tx, zone).await?;
                Ok::<_, LedgerError>((tx, stats))
            })
            .await?;
        // Write lock already held; see `write_record`
        tx.commit().await?;

        info!(
            records = stats.records_scanned,
            daily_rows = stats.daily_rows,
            monthly_rows = stats.monthly_rows,
            "Aggregate tables rebuilt from raw records"
        );
        Ok(stats)
    }

    /// Verify, and rebuild from raw records if anything disagrees
    ///
    /// Returns the report taken before the repair.
    pub async fn verify_or_repair(&self) -> Result<(ConsistencyReport, Option<RepairStats>)> {
        let report = self.verify().await?;
        if report.is_consistent() {
            return Ok((report, None));
        }
        let stats = self.repair().await?;
        Ok((report, Some(stats)))
    }

    pub async fn set_price(&self, model: &str, prompt_per_million: f64, completion_per_million: f64) -> Result<ModelPrice> {
        let price = self
            .pricing
            .upsert_model_price(model, prompt_per_million, completion_per_million)
            .await?;
        info!(model = %model, prompt = prompt_per_million, completion = completion_per_million, "Model price set");
        Ok(price)
    }

    pub async fn get_price(&self, model: &str) -> Result<Option<ModelPrice>> {
        self.pricing.get_model_price(model).await
    }

    pub async fn list_prices(&self) -> Result<Vec<ModelPrice>> {
        self.pricing.list_all_prices().await
    }

    pub async fn import_prices(&self, prices: &[ModelPrice]) -> Result<usize> {
        self.pricing.import_prices(prices).await
    }
}

#[async_trait]
impl UsageStore for Ledger {
    async fn record(&self, event: UsageEvent) -> Result<RecordReceipt> {
        Ledger::record(self, event).await
    }

    async fn query(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<UsageSummary> {
        Ledger::query(self, period, model, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingSource;
    use chrono::TimeZone;

    async fn ledger_with(settings: LedgerSettings) -> Ledger {
        let pool = store::connect_in_memory().await.unwrap();
        Ledger::new(pool, settings)
    }

    async fn ledger() -> Ledger {
        ledger_with(LedgerSettings::default()).await
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_record_known_model_then_query_today() {
        let ledger = ledger().await;
        ledger.set_price("claude-3-haiku", 0.25, 1.25).await.unwrap();

        let receipt = ledger
            .record(UsageEvent::new("claude-3-haiku", 1000, 500, "ask", "s1"))
            .await
            .unwrap();

        assert_eq!(receipt.pricing, PricingSource::Priced);
        assert_eq!(receipt.costs.prompt_cost, 0.00025);
        assert_eq!(receipt.costs.completion_cost, 0.000625);
        assert_eq!(receipt.costs.total_cost, 0.000875);

        let today = ledger.query(Period::Today, None, None).await.unwrap();
        assert_eq!(today.total_requests, 1);
        assert_eq!(today.total_tokens, 1500);
        assert!(approx(today.total_cost, 0.000875));
    }

    #[tokio::test]
    async fn test_record_unknown_model_zero_cost() {
        let ledger = ledger().await;

        let receipt = ledger
            .record(UsageEvent::new("mystery-model", 10, 20, "review", "s1").with_reported_cost(1.0))
            .await
            .unwrap();

        assert_eq!(receipt.pricing, PricingSource::Unpriced);
        assert_eq!(receipt.costs.total_cost, 0.0);

        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert_eq!(all.total_requests, 1);
        assert_eq!(all.total_tokens, 30);
        assert_eq!(all.total_cost, 0.0);
    }

    #[tokio::test]
    async fn test_record_unknown_model_caller_cost() {
        let ledger = ledger_with(LedgerSettings {
            pricing_miss: PricingMissPolicy::CallerCost,
            ..LedgerSettings::default()
        })
        .await;

        let receipt = ledger
            .record(UsageEvent::new("mystery-model", 100, 100, "ask", "s1").with_reported_cost(0.002))
            .await
            .unwrap();

        assert_eq!(receipt.pricing, PricingSource::CallerReported);
        assert!(approx(receipt.costs.total_cost, 0.002));

        let records = ledger.recent(Period::All, None, None, 10).await.unwrap();
        assert!(approx(records[0].prompt_cost + records[0].completion_cost, records[0].total_cost));
    }

    #[tokio::test]
    async fn test_invalid_input_writes_nothing() {
        let ledger = ledger().await;

        let err = ledger
            .record(UsageEvent::new("gemini-pro", -5, 10, "ask", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));

        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert!(all.is_empty());
        assert!(ledger.recent(Period::All, None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_records_same_day_today_month_all() {
        let ledger = ledger().await;
        // 1M tokens at $0.01 and 2M tokens at $0.01 per million
        ledger.set_price("gemini-pro", 0.01, 0.0).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        ledger
            .record_at(UsageEvent::new("gemini-pro", 1_000_000, 0, "ask", "s1"), now)
            .await
            .unwrap();
        ledger
            .record_at(UsageEvent::new("gemini-pro", 2_000_000, 0, "ask", "s1"), now)
            .await
            .unwrap();

        let today = ledger.query_at(Period::Today, None, None, now).await.unwrap();
        let month = ledger.query_at(Period::Month, None, None, now).await.unwrap();
        let all = ledger.query_at(Period::All, None, None, now).await.unwrap();

        assert!(approx(today.total_cost, 0.03));
        assert!(approx(month.total_cost, 0.03));
        assert!(all.total_cost >= 0.03 - 1e-9);
        assert_eq!(today.total_requests, 2);
    }

    #[tokio::test]
    async fn test_day_boundary_lands_in_distinct_rows() {
        let ledger = ledger().await;
        let last_instant = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap()
            + chrono::Duration::milliseconds(999);
        let first_instant = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        ledger
            .record_at(UsageEvent::new("m", 1, 1, "ask", "s"), last_instant)
            .await
            .unwrap();
        ledger
            .record_at(UsageEvent::new("m", 1, 1, "ask", "s"), first_instant)
            .await
            .unwrap();

        let daily: Vec<(String, i64)> = sqlx::query_as(
            "SELECT date, total_requests FROM daily_usage_summary ORDER BY date",
        )
        .fetch_all(ledger.pool())
        .await
        .unwrap();
        assert_eq!(
            daily,
            vec![("2025-01-31".to_string(), 1), ("2025-02-01".to_string(), 1)]
        );

        let monthly: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT month, total_requests FROM monthly_usage_summary ORDER BY month",
        )
        .fetch_all(ledger.pool())
        .await
        .unwrap();
        assert_eq!(monthly, vec![(1, 1), (2, 1)]);

        // Read at 00:01 the next day: only the post-midnight record is "today"
        let read_at = first_instant + chrono::Duration::minutes(1);
        let today = ledger.query_at(Period::Today, None, None, read_at).await.unwrap();
        assert_eq!(today.total_requests, 1);
    }

    #[tokio::test]
    async fn test_reference_zone_used_for_write_and_read() {
        let ledger = ledger_with(LedgerSettings {
            zone: "-05:00".parse().unwrap(),
            ..LedgerSettings::default()
        })
        .await;

        // 02:00 UTC on June 2nd is 21:00 on June 1st in UTC-5
        let written = Utc.with_ymd_and_hms(2025, 6, 2, 2, 0, 0).unwrap();
        ledger
            .record_at(UsageEvent::new("m", 5, 5, "ask", "s"), written)
            .await
            .unwrap();

        let (date,): (String,) = sqlx::query_as("SELECT date FROM daily_usage_summary")
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(date, "2025-06-01");

        let still_june_first = Utc.with_ymd_and_hms(2025, 6, 2, 4, 59, 0).unwrap();
        let today = ledger.query_at(Period::Today, None, None, still_june_first).await.unwrap();
        assert_eq!(today.total_requests, 1);

        let june_second = Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        let today = ledger.query_at(Period::Today, None, None, june_second).await.unwrap();
        assert!(today.is_empty());
    }

    #[tokio::test]
    async fn test_session_query_scans_raw_records() {
        let ledger = ledger().await;
        ledger.record(UsageEvent::new("a", 10, 10, "ask", "s1")).await.unwrap();
        ledger.record(UsageEvent::new("b", 1, 1, "ask", "s1")).await.unwrap();
        ledger.record(UsageEvent::new("a", 100, 100, "ask", "s2")).await.unwrap();

        let s1 = ledger.query(Period::Session, None, Some("s1")).await.unwrap();
        assert_eq!(s1.total_requests, 2);
        assert_eq!(s1.total_tokens, 22);

        let s1_model_a = ledger.query(Period::Session, Some("a"), Some("s1")).await.unwrap();
        assert_eq!(s1_model_a.total_requests, 1);

        let err = ledger.query(Period::Session, None, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_breakdown_ordered_by_cost_desc() {
        let ledger = ledger().await;
        ledger.set_price("cheap", 0.1, 0.1).await.unwrap();
        ledger.set_price("pricey", 10.0, 10.0).await.unwrap();

        ledger.record(UsageEvent::new("cheap", 1000, 1000, "ask", "s")).await.unwrap();
        ledger.record(UsageEvent::new("cheap", 1000, 1000, "ask", "s")).await.unwrap();
        ledger.record(UsageEvent::new("pricey", 1000, 1000, "ask", "s")).await.unwrap();

        let all = ledger.query(Period::All, None, None).await.unwrap();
        let models: Vec<&str> = all.by_model.iter().map(|m| m.model.as_str()).collect();
        assert_eq!(models, vec!["pricey", "cheap"]);

        let only_cheap = ledger.query(Period::All, Some("cheap"), None).await.unwrap();
        assert_eq!(only_cheap.total_requests, 2);
        assert_eq!(only_cheap.by_model.len(), 1);
    }

    #[tokio::test]
    async fn test_range_query_uses_daily_rows() {
        let ledger = ledger().await;
        for day in 1..=5 {
            let at = Utc.with_ymd_and_hms(2025, 3, day, 10, 0, 0).unwrap();
            ledger.record_at(UsageEvent::new("m", 1, 0, "ask", "s"), at).await.unwrap();
        }

        let period: Period = "2025-03-02..2025-03-04".parse().unwrap();
        let summary = ledger.query(period, None, None).await.unwrap();
        assert_eq!(summary.total_requests, 3);

        let records = ledger.recent(period, None, None, 10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].created_at, Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_recent_returns_newest_first_with_limit() {
        let ledger = ledger().await;
        let mut meta = Metadata::new();
        meta.insert("tool".to_string(), serde_json::json!("ai_code_review"));

        for minute in 0..5 {
            let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, minute, 0).unwrap();
            let event = UsageEvent::new("m", minute as i64, 0, "review", "s")
                .with_user("dev")
                .with_metadata(meta.clone());
            ledger.record_at(event, at).await.unwrap();
        }

        let records = ledger.recent(Period::All, None, None, 3).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].prompt_tokens, 4);
        assert_eq!(records[2].prompt_tokens, 2);
        assert_eq!(records[0].user_id.as_deref(), Some("dev"));
        assert_eq!(records[0].metadata.as_ref().unwrap()["tool"], "ai_code_review");
    }

    #[tokio::test]
    async fn test_closed_store_is_unavailable() {
        let ledger = ledger().await;
        ledger.close().await;

        let err = ledger
            .record(UsageEvent::new("m", 1, 1, "ask", "s"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        let err = ledger.query(Period::Today, None, None).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_verify_detects_and_repair_fixes_tampering() {
        let ledger = ledger().await;
        ledger.set_price("m", 1.0, 1.0).await.unwrap();
        for _ in 0..3 {
            ledger.record(UsageEvent::new("m", 1000, 1000, "ask", "s")).await.unwrap();
        }
        assert!(ledger.verify().await.unwrap().is_consistent());

        sqlx::query("UPDATE daily_usage_summary SET total_requests = 99")
            .execute(ledger.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM monthly_usage_summary")
            .execute(ledger.pool())
            .await
            .unwrap();

        let err = ledger.ensure_consistent().await.unwrap_err();
        assert!(matches!(err, LedgerError::AggregateInconsistency { mismatches: 2 }));

        let (report, stats) = ledger.verify_or_repair().await.unwrap();
        assert_eq!(report.mismatches.len(), 2);
        let stats = stats.unwrap();
        assert_eq!(stats.records_scanned, 3);
        assert_eq!(stats.daily_rows, 1);
        assert_eq!(stats.monthly_rows, 1);

        assert!(ledger.verify().await.unwrap().is_consistent());
        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert_eq!(all.total_requests, 3);
        assert!(approx(all.total_cost, 0.006));
    }

    #[tokio::test]
    async fn test_pricing_change_applies_to_next_write_only() {
        let ledger = ledger().await;
        ledger.set_price("m", 1.0, 0.0).await.unwrap();
        let first = ledger.record(UsageEvent::new("m", 1_000_000, 0, "ask", "s")).await.unwrap();
        ledger.set_price("m", 2.0, 0.0).await.unwrap();
        let second = ledger.record(UsageEvent::new("m", 1_000_000, 0, "ask", "s")).await.unwrap();

        assert_eq!(first.costs.total_cost, 1.0);
        assert_eq!(second.costs.total_cost, 2.0);
        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert!(approx(all.total_cost, 3.0));
    }

    #[tokio::test]
    async fn test_tokens_at_field_limit_sum_exactly() {
        use crate::ledger::event::MAX_TOKENS_PER_FIELD;

        let ledger = ledger().await;
        let max = MAX_TOKENS_PER_FIELD;
        for model in ["a", "a", "b"] {
            ledger
                .record(UsageEvent::new(model, max, max, "ask", "s"))
                .await
                .unwrap();
        }

        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert_eq!(all.total_requests, 3);
        assert_eq!(all.total_prompt_tokens, 3 * max);
        assert_eq!(all.total_tokens, 6 * max);
        assert_eq!(all.by_model[0].model, "a");
        assert_eq!(all.by_model[0].total_tokens, 4 * max);

        let today = ledger.query(Period::Today, None, None).await.unwrap();
        assert_eq!(today.total_tokens, 6 * max);
        assert!(ledger.verify().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_commit_lands_after_slow_staging() {
        let ledger = ledger_with(LedgerSettings {
            record_timeout: Duration::from_millis(50),
            ..LedgerSettings::default()
        })
        .await;
        let event = UsageEvent::new("m", 10, 5, "ask", "s");

        let (tx, receipt) = ledger
            .bounded("record", ledger.stage_record(&event, Utc::now()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.commit().await.unwrap();

        let records = ledger.recent(Period::All, None, None, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, receipt.id);
        assert!(ledger.verify().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_dropped_staged_record_leaves_nothing() {
        let ledger = ledger().await;
        let event = UsageEvent::new("m", 10, 5, "ask", "s");

        let (tx, _) = ledger.stage_record(&event, Utc::now()).await.unwrap();
        drop(tx);

        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert!(all.is_empty());
        assert!(ledger.recent(Period::All, None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_monthly_upsert_rolls_back_record() {
        let ledger = ledger().await;
        sqlx::query(
            "CREATE TRIGGER reject_monthly BEFORE INSERT ON monthly_usage_summary
             BEGIN SELECT RAISE(ABORT, 'monthly rejected'); END",
        )
        .execute(ledger.pool())
        .await
        .unwrap();

        let err = ledger
            .record(UsageEvent::new("m", 10, 5, "ask", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)), "unexpected error: {err}");

        for table in ["usage_records", "daily_usage_summary", "monthly_usage_summary"] {
            let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(ledger.pool())
                .await
                .unwrap();
            assert_eq!(rows, 0, "{table} kept rows from the failed record");
        }
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_fails_verify() {
        let ledger = ledger().await;
        ledger.record(UsageEvent::new("m", 10, 5, "ask", "s")).await.unwrap();
        sqlx::query(
            "INSERT INTO usage_records (id, created_at, model, prompt_tokens, completion_tokens, total_tokens, request_type, session_id)
             VALUES ('bad', ?1, 'm', 1, 1, 2, 'ask', 's')",
        )
        .bind(i64::MAX)
        .execute(ledger.pool())
        .await
        .unwrap();

        let err = ledger.verify().await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)), "unexpected error: {err}");

        let err = ledger.repair().await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)), "unexpected error: {err}");

        // The failed repair left the existing summaries in place
        let all = ledger.query(Period::All, None, None).await.unwrap();
        assert_eq!(all.total_requests, 1);
        assert_eq!(all.total_tokens, 15);
    }
}
