pub mod config;
pub mod error;
pub mod fallback;
pub mod ledger;
pub mod pricing;
pub mod report;
pub mod store;
pub mod time;

pub use error::{LedgerError, Result};
pub use fallback::{SessionCounter, TrackedUsage, UsageTracker};
pub use ledger::{
    Ledger, LedgerSettings, Period, RecordReceipt, UsageEvent, UsageRecord, UsageStore,
    UsageSummary,
};
pub use time::ReferenceZone;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Honors `RUST_LOG` (default `info`). Set `LOG_FORMAT=json` for one JSON
/// object per line. Can only be called once per process.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
