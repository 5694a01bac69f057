use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::pricing::PricingMissPolicy;
use crate::time::ReferenceZone;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Durable store connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// SQLite database URL (default: "sqlite:./data/usage.db")
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Pool size (default: 5)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite waits on a locked database before giving up (default: 5000)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Ledger behavior settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Fixed UTC offset used to bucket records into days and months (default: "+00:00")
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Upper bound for a single record or query against the store (default: 2000)
    #[serde(default = "default_record_timeout_ms")]
    pub record_timeout_ms: u64,

    /// What to do when a model has no pricing row (default: zero_cost)
    #[serde(default)]
    pub pricing_miss: PricingMissPolicy,

    /// Allowed cost drift between aggregates and raw records (default: 1e-6)
    #[serde(default = "default_consistency_tolerance")]
    pub consistency_tolerance: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            record_timeout_ms: default_record_timeout_ms(),
            pricing_miss: PricingMissPolicy::default(),
            consistency_tolerance: default_consistency_tolerance(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:./data/usage.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_timezone() -> String {
    "+00:00".to_string()
}

fn default_record_timeout_ms() -> u64 {
    2000
}

fn default_consistency_tolerance() -> f64 {
    1e-6
}

/// Load configuration from an optional file plus `USAGE_LEDGER__*` environment overrides
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("USAGE_LEDGER").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.store.database_url.is_empty() {
        anyhow::bail!("store.database_url cannot be empty");
    }

    if cfg.store.max_connections == 0 {
        anyhow::bail!("store.max_connections must be >= 1");
    }

    if cfg.ledger.record_timeout_ms == 0 {
        anyhow::bail!("ledger.record_timeout_ms must be >= 1");
    }

    let tolerance = cfg.ledger.consistency_tolerance;
    if tolerance.is_nan() || tolerance < 0.0 {
        anyhow::bail!("ledger.consistency_tolerance must be non-negative");
    }

    cfg.ledger
        .timezone
        .parse::<ReferenceZone>()
        .map_err(|e| anyhow::anyhow!("ledger.timezone: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.ledger.pricing_miss, PricingMissPolicy::ZeroCost);
        assert_eq!(cfg.store.database_url, "sqlite:./data/usage.db");
    }

    #[test]
    fn test_validate_config_rejects_bad_timezone() {
        let mut cfg = Config::default();
        cfg.ledger.timezone = "Mars/Olympus".to_string();

        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("ledger.timezone"));
    }

    #[test]
    fn test_validate_config_rejects_zero_timeout() {
        let mut cfg = Config::default();
        cfg.ledger.record_timeout_ms = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [ledger]
            timezone = "-05:00"
            pricing_miss = "caller_cost"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.ledger.timezone, "-05:00");
        assert_eq!(cfg.ledger.pricing_miss, PricingMissPolicy::CallerCost);
        assert_eq!(cfg.ledger.record_timeout_ms, 2000);
        assert_eq!(cfg.store.max_connections, 5);
    }
}
