use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{LedgerError, Result};
use crate::pricing::{CostBreakdown, PricingSource};

/// Upper bound for a single prompt or completion token count
///
/// Keeps aggregate sums far away from i64 overflow, which SQLite would
/// otherwise silently turn into REAL.
pub const MAX_TOKENS_PER_FIELD: i64 = u32::MAX as i64;

/// Free-form key/value metadata attached to a record, opaque to the ledger
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Identifier assigned to a usage record at write time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A completed provider request, as reported by the calling server
///
/// Token counts are signed so that bad input from the caller can be rejected
/// instead of silently wrapping or clamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub request_type: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Cost reported by the provider, used only under `PricingMissPolicy::CallerCost`
    #[serde(default)]
    pub reported_cost: Option<f64>,
}

impl UsageEvent {
    pub fn new(
        model: impl Into<String>,
        prompt_tokens: i64,
        completion_tokens: i64,
        request_type: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            request_type: request_type.into(),
            session_id: session_id.into(),
            user_id: None,
            metadata: None,
            reported_cost: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_reported_cost(mut self, cost: f64) -> Self {
        self.reported_cost = Some(cost);
        self
    }

    /// Always recomputed; callers never supply a total
    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Reject malformed events before anything touches the store
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(LedgerError::InvalidInput("model is required".to_string()));
        }
        if self.request_type.trim().is_empty() {
            return Err(LedgerError::InvalidInput("request_type is required".to_string()));
        }
        if self.session_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("session_id is required".to_string()));
        }
        if self.prompt_tokens < 0 {
            return Err(LedgerError::InvalidInput(format!(
                "prompt_tokens must be non-negative, got {}",
                self.prompt_tokens
            )));
        }
        if self.completion_tokens < 0 {
            return Err(LedgerError::InvalidInput(format!(
                "completion_tokens must be non-negative, got {}",
                self.completion_tokens
            )));
        }
        if self.prompt_tokens > MAX_TOKENS_PER_FIELD || self.completion_tokens > MAX_TOKENS_PER_FIELD {
            return Err(LedgerError::InvalidInput(format!(
                "token counts must not exceed {}, got {} prompt / {} completion",
                MAX_TOKENS_PER_FIELD, self.prompt_tokens, self.completion_tokens
            )));
        }
        if let Some(cost) = self.reported_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(LedgerError::InvalidInput(format!(
                    "reported_cost must be a non-negative number, got {}",
                    cost
                )));
            }
        }
        Ok(())
    }
}

/// What `record()` hands back to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReceipt {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub total_tokens: i64,
    pub costs: CostBreakdown,
    pub pricing: PricingSource,
}

/// One persisted row of `usage_records`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub total_cost: f64,
    pub request_type: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub metadata: Option<Metadata>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for UsageRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let created_at_ms: i64 = row.try_get("created_at")?;
        let created_at = Utc
            .timestamp_millis_opt(created_at_ms)
            .single()
            .ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "created_at".to_string(),
                source: format!("invalid timestamp {}", created_at_ms).into(),
            })?;

        let metadata: Option<String> = row.try_get("metadata")?;
        let metadata = metadata
            .map(|raw| serde_json::from_str::<Metadata>(&raw))
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "metadata".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: RecordId(row.try_get("id")?),
            created_at,
            model: row.try_get("model")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            total_tokens: row.try_get("total_tokens")?,
            prompt_cost: row.try_get("prompt_cost")?,
            completion_cost: row.try_get("completion_cost")?,
            total_cost: row.try_get("total_cost")?,
            request_type: row.try_get("request_type")?,
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            metadata,
        })
    }
}
