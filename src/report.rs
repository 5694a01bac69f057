//! Human-readable rendering of summaries and record history

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use crate::fallback::TrackedUsage;
use crate::ledger::{UsageRecord, UsageSummary};
use crate::time::ReferenceZone;

/// Render a summary as a header line, a per-model table and a total line
pub fn render_summary(summary: &UsageSummary) -> String {
    let mut out = format!("Usage ({}):\n", summary.period.label());

    if summary.is_empty() {
        out.push_str("  No usage recorded\n");
        return out;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("MODEL").fg(Color::Cyan),
        Cell::new("REQUESTS").fg(Color::Cyan),
        Cell::new("PROMPT").fg(Color::Cyan),
        Cell::new("COMPLETION").fg(Color::Cyan),
        Cell::new("TOTAL TOKENS").fg(Color::Cyan),
        Cell::new("TOTAL COST").fg(Color::Cyan),
        Cell::new("COST PERCENTAGE").fg(Color::Cyan),
    ]);

    for row in &summary.by_model {
        let cost_percentage = if summary.total_cost > 0.0 {
            (row.total_cost / summary.total_cost) * 100.0
        } else {
            0.0
        };

        table.add_row(vec![
            Cell::new(truncate_model_name(&row.model)),
            Cell::new(format_number(row.total_requests)),
            Cell::new(format_number(row.total_prompt_tokens)),
            Cell::new(format_number(row.total_completion_tokens)),
            Cell::new(format_number(row.total_tokens)),
            Cell::new(format_cost(row.total_cost)),
            Cell::new(format!("{:.1}%", cost_percentage)),
        ]);
    }

    out.push_str(&table.to_string());
    out.push_str(&format!(
        "\nTotal: {} requests, {} tokens, {}\n",
        format_number(summary.total_requests),
        format_number(summary.total_tokens),
        format_cost(summary.total_cost)
    ));
    out
}

/// Like `render_summary`, with a note when in-memory counts were merged in
pub fn render_tracked(usage: &TrackedUsage) -> String {
    let mut out = render_summary(&usage.summary);
    if usage.degraded {
        out.push_str("Note: includes requests counted in memory while the store was unavailable\n");
    }
    out
}

/// Render raw records newest first, timestamps shown in the reference zone
pub fn render_records(records: &[UsageRecord], zone: ReferenceZone) -> String {
    if records.is_empty() {
        return "Recent Requests: No data available\n".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("TIME").fg(Color::Cyan),
        Cell::new("MODEL").fg(Color::Cyan),
        Cell::new("TYPE").fg(Color::Cyan),
        Cell::new("SESSION").fg(Color::Cyan),
        Cell::new("PROMPT").fg(Color::Cyan),
        Cell::new("COMPLETION").fg(Color::Cyan),
        Cell::new("COST").fg(Color::Cyan),
    ]);

    for record in records {
        let local = record.created_at.with_timezone(&zone.offset());
        table.add_row(vec![
            Cell::new(local.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(truncate_model_name(&record.model)),
            Cell::new(&record.request_type),
            Cell::new(&record.session_id),
            Cell::new(format_number(record.prompt_tokens)),
            Cell::new(format_number(record.completion_tokens)),
            Cell::new(format_cost(record.total_cost)),
        ]);
    }

    format!("Recent Requests:\n{}\n", table)
}

pub fn format_cost(cost: f64) -> String {
    format!("${:.6}", cost)
}

/// Format number with K/M suffix
pub fn format_number(n: i64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Truncate model name if too long
pub fn truncate_model_name(name: &str) -> String {
    const MAX_LEN: usize = 28;
    if name.chars().count() > MAX_LEN {
        let head: String = name.chars().take(MAX_LEN - 3).collect();
        format!("{}...", head)
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ModelUsage, Period};

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.5K");
        assert_eq!(format_number(2_000_000), "2.0M");
    }

    #[test]
    fn test_truncate_model_name() {
        assert_eq!(truncate_model_name("claude-3-haiku"), "claude-3-haiku");
        let long = "a-very-long-model-name-that-goes-on-and-on";
        let truncated = truncate_model_name(long);
        assert_eq!(truncated.chars().count(), 28);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_render_empty_summary() {
        let text = render_summary(&UsageSummary::empty(Period::Today));
        assert!(text.starts_with("Usage (Today):"));
        assert!(text.contains("No usage recorded"));
    }

    #[test]
    fn test_render_summary_includes_models_and_total() {
        let mut row = ModelUsage::empty("claude-3-haiku");
        row.add_request(1000, 500, 0.000875);
        let summary = UsageSummary::from_models(Period::Month, vec![row]);

        let text = render_summary(&summary);
        assert!(text.contains("Usage (This Month):"));
        assert!(text.contains("claude-3-haiku"));
        assert!(text.contains("Total: 1 requests, 1.5K tokens, $0.000875"));
    }

    #[test]
    fn test_render_tracked_marks_degraded() {
        let usage = TrackedUsage {
            summary: UsageSummary::empty(Period::Session),
            degraded: true,
        };
        assert!(render_tracked(&usage).contains("counted in memory"));
    }
}
