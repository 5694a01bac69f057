use anyhow::Result;
use std::path::Path;

/// Execute the migrate command
///
/// Opening the ledger applies any pending migrations.
pub async fn execute(config_path: &Path) -> Result<()> {
    let ledger = super::open_ledger(config_path).await?;
    println!("Usage store is up to date");
    ledger.close().await;
    Ok(())
}
