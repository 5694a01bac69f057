use anyhow::{bail, Result};
use serde::Serialize;
use std::path::Path;
use usage_ledger::ledger::period;
use usage_ledger::report;
use usage_ledger::{Period, UsageRecord, UsageSummary};

use crate::cli::UsageArgs;

#[derive(Serialize)]
struct UsageOutput<'a> {
    summary: &'a UsageSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    recent: Option<&'a [UsageRecord]>,
}

/// Execute the usage command
pub async fn execute(config_path: &Path, args: UsageArgs) -> Result<()> {
    let period = resolve_period(&args)?;
    let ledger = super::open_ledger(config_path).await?;

    let model = args.model.as_deref();
    let session = args.session.as_deref();

    let summary = ledger.query(period, model, session).await?;
    let recent = if args.detailed {
        Some(ledger.recent(period, model, session, args.limit).await?)
    } else {
        None
    };

    if args.json {
        let output = UsageOutput {
            summary: &summary,
            recent: recent.as_deref(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", report::render_summary(&summary));
        if let Some(records) = &recent {
            println!();
            print!("{}", report::render_records(records, ledger.settings().zone));
        }
    }

    ledger.close().await;
    Ok(())
}

/// Turn the period flags into a `Period`
fn resolve_period(args: &UsageArgs) -> Result<Period> {
    if args.period.eq_ignore_ascii_case("range") {
        return match (args.from, args.to) {
            (Some(from), Some(to)) => Ok(period::range(from, to)?),
            _ => bail!("--period range requires both --from and --to"),
        };
    }
    if args.from.is_some() || args.to.is_some() {
        bail!("--from/--to only apply to --period range");
    }

    let period: Period = args.period.parse()?;
    if period == Period::Session && args.session.is_none() {
        bail!("--period session requires --session");
    }
    Ok(period)
}
