//! Command implementations for the CLI
//!
//! - migrate: open the store and apply migrations
//! - record: record one completed request
//! - usage: aggregated usage and recent history
//! - pricing: model price management
//! - verify: aggregate consistency check and repair

pub mod migrate;
pub mod pricing;
pub mod record;
pub mod usage;
pub mod verify;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use usage_ledger::config;
use usage_ledger::Ledger;

/// Load configuration and open the ledger it describes
pub(crate) async fn open_ledger(config_path: &Path) -> Result<Ledger> {
    info!(path = %config_path.display(), "Loading configuration");
    let cfg = config::load_config(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let ledger = Ledger::open(&cfg)
        .await
        .with_context(|| format!("failed to open usage store {}", cfg.store.database_url))?;
    Ok(ledger)
}
