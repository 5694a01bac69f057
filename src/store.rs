//! SQLite store for the usage ledger
//!
//! - Connection pooling
//! - Automatic migrations
//! - WAL mode so several assistant sessions can share one database file

use crate::config::StoreConfig;
use crate::error::{LedgerError, Result};
use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;

/// Open the store described by `cfg` and run migrations
///
/// Connection failures surface as `StoreUnavailable`.
pub async fn connect(cfg: &StoreConfig, acquire_timeout: Duration) -> Result<SqlitePool> {
    let in_memory = cfg.database_url.contains(":memory:");

    let options = SqliteConnectOptions::from_str(&cfg.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
        .pragma("synchronous", "NORMAL")
        .foreign_keys(true);

    // An in-memory database lives and dies with its connection, so the pool
    // must hold exactly one connection forever.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(cfg.max_connections)
    };

    if !in_memory {
        ensure_parent_dir(&cfg.database_url);
    }

    let pool = pool_options
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Fresh in-memory store with migrations applied
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let cfg = StoreConfig {
        database_url: "sqlite::memory:".to_string(),
        ..StoreConfig::default()
    };
    connect(&cfg, Duration::from_secs(5)).await
}

const MIGRATION_ATTEMPTS: u32 = 5;

/// Run database migrations
///
/// SQLite migrations take no cross-process lock, so two pools opening a
/// fresh file can both try to record the same version. The loser sees a
/// constraint or busy error; on retry the version is already applied and
/// the run is a no-op.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let migrator = sqlx::migrate!("./migrations");

    let mut attempt = 1;
    loop {
        match migrator.run(pool).await {
            Ok(()) => break,
            Err(err) if is_migration_race(&err) => {
                if attempt >= MIGRATION_ATTEMPTS {
                    tracing::error!(attempts = attempt, error = %err, "Migrations kept colliding with another writer");
                    return Err(LedgerError::StoreUnavailable(format!(
                        "migrations contended after {} attempts: {}",
                        attempt, err
                    )));
                }
                tracing::debug!(attempt, error = %err, "Migration raced another writer, retrying");
                tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    tracing::debug!("Usage ledger migrations completed");
    Ok(())
}

/// Constraint, busy or locked failures while applying a migration
fn is_migration_race(err: &MigrateError) -> bool {
    let db_err = match err {
        MigrateError::Execute(sqlx::Error::Database(db_err))
        | MigrateError::ExecuteMigration(sqlx::Error::Database(db_err), _) => db_err,
        _ => return false,
    };

    let primary = db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED | SQLITE_CONSTRAINT))
}

fn ensure_parent_dir(database_url: &str) {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }
        }
    }
}
