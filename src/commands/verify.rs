use anyhow::{bail, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use std::path::Path;
use usage_ledger::ledger::{AggregateTable, ConsistencyReport, ModelUsage};
use usage_ledger::report::format_cost;

/// Execute the verify command
///
/// Exits with an error when aggregates disagree and `--repair` was not given.
pub async fn execute(config_path: &Path, repair: bool) -> Result<()> {
    let ledger = super::open_ledger(config_path).await?;

    let (report, stats) = if repair {
        ledger.verify_or_repair().await?
    } else {
        (ledger.verify().await?, None)
    };

    println!(
        "Scanned {} records, {} daily rows, {} monthly rows",
        report.records_scanned, report.daily_rows, report.monthly_rows
    );

    let consistent = report.is_consistent();
    if consistent {
        println!("✓ Aggregates match raw records");
    } else {
        println!("✗ {} aggregate rows disagree with raw records", report.mismatches.len());
        print!("{}", render_mismatches(&report));
    }

    if let Some(stats) = stats {
        println!(
            "Rebuilt aggregates from {} records: {} daily rows, {} monthly rows",
            stats.records_scanned, stats.daily_rows, stats.monthly_rows
        );
    }

    ledger.close().await;

    if !consistent && !repair {
        bail!("aggregate tables are inconsistent; rerun with --repair");
    }
    Ok(())
}

fn render_mismatches(report: &ConsistencyReport) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("TABLE").fg(Color::Cyan),
        Cell::new("BUCKET").fg(Color::Cyan),
        Cell::new("MODEL").fg(Color::Cyan),
        Cell::new("STORED").fg(Color::Cyan),
        Cell::new("FROM RECORDS").fg(Color::Cyan),
    ]);

    for m in &report.mismatches {
        let table_name = match m.table {
            AggregateTable::Daily => "daily",
            AggregateTable::Monthly => "monthly",
        };
        table.add_row(vec![
            Cell::new(table_name),
            Cell::new(&m.bucket),
            Cell::new(&m.model),
            Cell::new(describe(m.stored.as_ref())).fg(Color::Red),
            Cell::new(describe(m.recomputed.as_ref())).fg(Color::Green),
        ]);
    }

    format!("{}\n", table)
}

fn describe(usage: Option<&ModelUsage>) -> String {
    match usage {
        Some(u) => format!(
            "{} req, {} tok, {}",
            u.total_requests,
            u.total_tokens,
            format_cost(u.total_cost)
        ),
        None => "missing".to_string(),
    }
}
