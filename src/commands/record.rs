use anyhow::Result;
use std::path::Path;
use usage_ledger::ledger::Metadata;
use usage_ledger::pricing::PricingSource;
use usage_ledger::report::{format_cost, format_number};
use usage_ledger::UsageEvent;

use crate::cli::RecordArgs;

/// Execute the record command
pub async fn execute(config_path: &Path, args: RecordArgs) -> Result<()> {
    let ledger = super::open_ledger(config_path).await?;
    let event = build_event(args);

    let receipt = ledger.record(event).await?;

    println!("Recorded {}", receipt.id);
    println!(
        "  Tokens: {}  Cost: {} (prompt {}, completion {})",
        format_number(receipt.total_tokens),
        format_cost(receipt.costs.total_cost),
        format_cost(receipt.costs.prompt_cost),
        format_cost(receipt.costs.completion_cost),
    );
    match receipt.pricing {
        PricingSource::Priced => {}
        PricingSource::CallerReported => println!("  Model has no price; used the reported cost"),
        PricingSource::Unpriced => println!("  Model has no price; recorded at zero cost"),
    }

    ledger.close().await;
    Ok(())
}

fn build_event(args: RecordArgs) -> UsageEvent {
    let mut event = UsageEvent::new(
        args.model,
        args.prompt_tokens,
        args.completion_tokens,
        args.kind,
        args.session,
    );
    if let Some(user) = args.user {
        event = event.with_user(user);
    }
    if let Some(cost) = args.cost {
        event = event.with_reported_cost(cost);
    }
    if !args.meta.is_empty() {
        let metadata: Metadata = args
            .meta
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        event = event.with_metadata(metadata);
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_event_carries_optional_fields() {
        let args = RecordArgs {
            model: "gemini-pro".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            kind: "review".to_string(),
            session: "s1".to_string(),
            user: Some("dev".to_string()),
            cost: Some(0.5),
            meta: vec![("tool".to_string(), "ai_code_review".to_string())],
        };

        let event = build_event(args);
        assert_eq!(event.total_tokens(), 30);
        assert_eq!(event.user_id.as_deref(), Some("dev"));
        assert_eq!(event.reported_cost, Some(0.5));
        assert_eq!(event.metadata.unwrap()["tool"], "ai_code_review");
    }
}
