//! Daily and monthly summary tables
//!
//! The summaries are only ever written here: incrementally by the record write
//! path, or wholesale by `rebuild` when a consistency check fails.

use chrono::{NaiveDate, TimeZone, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::ledger::summary::ModelUsage;
use crate::pricing::round_cost;
use crate::time::{ReferenceZone, YearMonth};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// The two derived tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateTable {
    Daily,
    Monthly,
}

/// Token and cost deltas of a single record
#[derive(Debug, Clone, Copy)]
pub(crate) struct Increment {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

/// Add one request to the (date, model) row, creating it if absent
///
/// Single statement so the addition happens inside the database; concurrent
/// writers can never lose an increment.
pub(crate) async fn increment_daily(
    conn: &mut SqliteConnection,
    date: NaiveDate,
    model: &str,
    inc: Increment,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_usage_summary (
            date, model, total_requests, total_prompt_tokens,
            total_completion_tokens, total_tokens, total_cost
        )
        VALUES (?, ?, 1, ?, ?, ?, ?)
        ON CONFLICT(date, model) DO UPDATE SET
            total_requests = total_requests + 1,
            total_prompt_tokens = total_prompt_tokens + excluded.total_prompt_tokens,
            total_completion_tokens = total_completion_tokens + excluded.total_completion_tokens,
            total_tokens = total_tokens + excluded.total_tokens,
            total_cost = total_cost + excluded.total_cost
        "#,
    )
    .bind(date.format(DATE_FORMAT).to_string())
    .bind(model)
    .bind(inc.prompt_tokens)
    .bind(inc.completion_tokens)
    .bind(inc.total_tokens)
    .bind(inc.total_cost)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Add one request to the (year, month, model) row, creating it if absent
pub(crate) async fn increment_monthly(
    conn: &mut SqliteConnection,
    month: YearMonth,
    model: &str,
    inc: Increment,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO monthly_usage_summary (
            year, month, model, total_requests, total_prompt_tokens,
            total_completion_tokens, total_tokens, total_cost
        )
        VALUES (?, ?, ?, 1, ?, ?, ?, ?)
        ON CONFLICT(year, month, model) DO UPDATE SET
            total_requests = total_requests + 1,
            total_prompt_tokens = total_prompt_tokens + excluded.total_prompt_tokens,
            total_completion_tokens = total_completion_tokens + excluded.total_completion_tokens,
            total_tokens = total_tokens + excluded.total_tokens,
            total_cost = total_cost + excluded.total_cost
        "#,
    )
    .bind(month.year)
    .bind(month.month as i64)
    .bind(model)
    .bind(inc.prompt_tokens)
    .bind(inc.completion_tokens)
    .bind(inc.total_tokens)
    .bind(inc.total_cost)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Summary rows keyed by bucket and model
#[derive(Debug, Default)]
pub(crate) struct Buckets {
    pub daily: BTreeMap<(String, String), ModelUsage>,
    pub monthly: BTreeMap<(String, String), ModelUsage>,
    pub records: u64,
}

/// Derive both summary tables from raw records
pub(crate) async fn recompute(conn: &mut SqliteConnection, zone: ReferenceZone) -> Result<Buckets> {
    let rows = sqlx::query_as::<_, (String, i64, i64, i64, f64)>(
        "SELECT model, created_at, prompt_tokens, completion_tokens, total_cost FROM usage_records",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut buckets = Buckets::default();

    for (model, created_at, prompt_tokens, completion_tokens, total_cost) in rows {
        let instant = Utc.timestamp_millis_opt(created_at).single().ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "created_at".to_string(),
                source: format!("timestamp {} out of range", created_at).into(),
            }
        })?;

        let day = zone.date_of(instant).format(DATE_FORMAT).to_string();
        let month = zone.month_of(instant).to_string();

        buckets
            .daily
            .entry((day, model.clone()))
            .or_insert_with(|| ModelUsage::empty(model.clone()))
            .add_request(prompt_tokens, completion_tokens, total_cost);
        buckets
            .monthly
            .entry((month, model.clone()))
            .or_insert_with(|| ModelUsage::empty(model))
            .add_request(prompt_tokens, completion_tokens, total_cost);
        buckets.records += 1;
    }

    Ok(buckets)
}

/// Current contents of both summary tables
pub(crate) async fn load_stored(conn: &mut SqliteConnection) -> Result<Buckets> {
    let mut buckets = Buckets::default();

    let daily = sqlx::query_as::<_, (String, String, i64, i64, i64, i64, f64)>(
        r#"
        SELECT date, model, total_requests, total_prompt_tokens,
               total_completion_tokens, total_tokens, total_cost
        FROM daily_usage_summary
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (date, model, requests, prompt, completion, total, cost) in daily {
        buckets
            .daily
            .insert((date, model.clone()), usage_row(model, requests, prompt, completion, total, cost));
    }

    let monthly = sqlx::query_as::<_, (i64, i64, String, i64, i64, i64, i64, f64)>(
        r#"
        SELECT year, month, model, total_requests, total_prompt_tokens,
               total_completion_tokens, total_tokens, total_cost
        FROM monthly_usage_summary
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    for (year, month, model, requests, prompt, completion, total, cost) in monthly {
        let key = format!("{:04}-{:02}", year, month);
        buckets
            .monthly
            .insert((key, model.clone()), usage_row(model, requests, prompt, completion, total, cost));
    }

    Ok(buckets)
}

fn usage_row(model: String, requests: i64, prompt: i64, completion: i64, total: i64, cost: f64) -> ModelUsage {
    ModelUsage {
        model,
        total_requests: requests,
        total_prompt_tokens: prompt,
        total_completion_tokens: completion,
        total_tokens: total,
        total_cost: cost,
    }
}

/// One summary row that disagrees with its recomputation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateMismatch {
    pub table: AggregateTable,
    /// `YYYY-MM-DD` for daily rows, `YYYY-MM` for monthly rows
    pub bucket: String,
    pub model: String,
    pub stored: Option<ModelUsage>,
    pub recomputed: Option<ModelUsage>,
}

/// Result of comparing the summary tables with raw records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub records_scanned: u64,
    pub daily_rows: usize,
    pub monthly_rows: usize,
    pub mismatches: Vec<AggregateMismatch>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

fn rows_match(stored: &ModelUsage, recomputed: &ModelUsage, tolerance: f64) -> bool {
    stored.total_requests == recomputed.total_requests
        && stored.total_prompt_tokens == recomputed.total_prompt_tokens
        && stored.total_completion_tokens == recomputed.total_completion_tokens
        && stored.total_tokens == recomputed.total_tokens
        && (stored.total_cost - recomputed.total_cost).abs() <= tolerance
}

fn diff_table(
    table: AggregateTable,
    stored: &BTreeMap<(String, String), ModelUsage>,
    recomputed: &BTreeMap<(String, String), ModelUsage>,
    tolerance: f64,
    out: &mut Vec<AggregateMismatch>,
) {
    let keys: BTreeSet<&(String, String)> = stored.keys().chain(recomputed.keys()).collect();

    for key in keys {
        let s = stored.get(key);
        let r = recomputed.get(key);
        let matches = match (s, r) {
            (Some(s), Some(r)) => rows_match(s, r, tolerance),
            // Present on one side only
            _ => false,
        };
        if !matches {
            out.push(AggregateMismatch {
                table,
                bucket: key.0.clone(),
                model: key.1.clone(),
                stored: s.cloned(),
                recomputed: r.cloned(),
            });
        }
    }
}

/// Compare stored summaries against a fresh derivation
pub(crate) fn compare(stored: &Buckets, recomputed: &Buckets, tolerance: f64) -> ConsistencyReport {
    let mut mismatches = Vec::new();
    diff_table(AggregateTable::Daily, &stored.daily, &recomputed.daily, tolerance, &mut mismatches);
    diff_table(AggregateTable::Monthly, &stored.monthly, &recomputed.monthly, tolerance, &mut mismatches);

    ConsistencyReport {
        records_scanned: recomputed.records,
        daily_rows: stored.daily.len(),
        monthly_rows: stored.monthly.len(),
        mismatches,
    }
}

/// Counts from a rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    pub records_scanned: u64,
    pub daily_rows: usize,
    pub monthly_rows: usize,
}

/// Replace both summary tables with a derivation from raw records
///
/// Must run inside a transaction. The deletes come first so the write lock is
/// taken before raw records are read.
pub(crate) async fn rebuild(conn: &mut SqliteConnection, zone: ReferenceZone) -> Result<RepairStats> {
    sqlx::query("DELETE FROM daily_usage_summary").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM monthly_usage_summary").execute(&mut *conn).await?;

    let buckets = recompute(conn, zone).await?;

    for ((date, _), row) in &buckets.daily {
        sqlx::query(
            r#"
            INSERT INTO daily_usage_summary (
                date, model, total_requests, total_prompt_tokens,
                total_completion_tokens, total_tokens, total_cost
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(date)
        .bind(&row.model)
        .bind(row.total_requests)
        .bind(row.total_prompt_tokens)
        .bind(row.total_completion_tokens)
        .bind(row.total_tokens)
        .bind(round_cost(row.total_cost))
        .execute(&mut *conn)
        .await?;
    }

    for ((month, _), row) in &buckets.monthly {
        let (year, month_no) = split_month_key(month);
        sqlx::query(
            r#"
            INSERT INTO monthly_usage_summary (
                year, month, model, total_requests, total_prompt_tokens,
                total_completion_tokens, total_tokens, total_cost
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(year)
        .bind(month_no)
        .bind(&row.model)
        .bind(row.total_requests)
        .bind(row.total_prompt_tokens)
        .bind(row.total_completion_tokens)
        .bind(row.total_tokens)
        .bind(round_cost(row.total_cost))
        .execute(&mut *conn)
        .await?;
    }

    Ok(RepairStats {
        records_scanned: buckets.records,
        daily_rows: buckets.daily.len(),
        monthly_rows: buckets.monthly.len(),
    })
}

fn split_month_key(key: &str) -> (i64, i64) {
    let (year, month) = key.split_once('-').unwrap_or((key, "1"));
    (year.parse().unwrap_or_default(), month.parse().unwrap_or(1))
}
