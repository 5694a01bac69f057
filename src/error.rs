use thiserror::Error;

/// Ledger error types
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Rejected before any write (negative token counts, missing fields)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Durable store unreachable or the operation timed out
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// No pricing row for the model
    #[error("No pricing for model: {0}")]
    PricingMissing(String),

    /// Aggregate tables disagree with a recomputation from raw records
    #[error("Aggregate inconsistency: {mismatches} mismatched rows")]
    AggregateInconsistency { mismatches: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other database failure
    #[error("Store error: {0}")]
    Store(sqlx::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    /// Short machine-readable name, used in structured logs and JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::PricingMissing(_) => "pricing_missing",
            Self::AggregateInconsistency { .. } => "aggregate_inconsistency",
            Self::Config(_) => "config_error",
            Self::Store(_) => "store_error",
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

// SQLite primary result codes that mean "try again later" or "cannot reach the file"
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_CANTOPEN: i32 = 14;

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => Self::StoreUnavailable(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);

                match primary {
                    Some(SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_CANTOPEN) => {
                        Self::StoreUnavailable(err.to_string())
                    }
                    _ => Self::Store(err),
                }
            }
            _ => Self::Store(err),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        match err {
            sqlx::migrate::MigrateError::Execute(inner)
            | sqlx::migrate::MigrateError::ExecuteMigration(inner, _) => inner.into(),
            other => Self::Store(sqlx::Error::Migrate(Box::new(other))),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("JSON error: {}", err))
    }
}
