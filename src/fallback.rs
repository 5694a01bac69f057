//! Degraded-mode usage tracking
//!
//! The bridging server must never fail an AI response because accounting is
//! down. `UsageTracker` wraps any `UsageStore` and, when the store reports
//! `StoreUnavailable`, counts the request in a process-local `SessionCounter`
//! instead. Session queries merge those counts back in.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::Result;
use crate::ledger::{ModelUsage, Period, RecordReceipt, UsageEvent, UsageStore, UsageSummary};

/// In-memory per-session, per-model counter used while the store is down
#[derive(Debug, Default, Clone)]
pub struct SessionCounter {
    // (session_id, model) -> totals
    entries: Arc<DashMap<(String, String), ModelUsage>>,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request; cost is whatever the caller reported, else zero
    pub fn add(&self, event: &UsageEvent) {
        let cost = event.reported_cost.filter(|c| c.is_finite() && *c >= 0.0).unwrap_or(0.0);
        let prompt = event.prompt_tokens.max(0);
        let completion = event.completion_tokens.max(0);

        self.entries
            .entry((event.session_id.clone(), event.model.clone()))
            .or_insert_with(|| ModelUsage::empty(event.model.clone()))
            .add_request(prompt, completion, cost);
    }

    /// Summary of everything counted for a session
    pub fn summary(&self, session_id: &str, model: Option<&str>) -> UsageSummary {
        let rows: Vec<ModelUsage> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .filter(|entry| model.map_or(true, |m| entry.key().1 == m))
            .map(|entry| entry.value().clone())
            .collect();

        UsageSummary::from_models(Period::Session, rows)
    }

    /// Requests counted across all sessions
    pub fn total_requests(&self) -> i64 {
        self.entries.iter().map(|e| e.value().total_requests).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Summary returned by the tracker, flagged when fallback counts are included
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedUsage {
    pub summary: UsageSummary,
    /// True when any part of the summary came from the in-memory counter
    pub degraded: bool,
}

/// Best-effort facade over a `UsageStore`
#[derive(Clone)]
pub struct UsageTracker<S> {
    store: S,
    fallback: SessionCounter,
}

impl<S: UsageStore> UsageTracker<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            fallback: SessionCounter::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fallback(&self) -> &SessionCounter {
        &self.fallback
    }

    /// Record usage without ever failing the caller
    ///
    /// Returns the receipt when the ledger accepted the event. Store outages
    /// are counted in memory; rejected input is logged and dropped.
    pub async fn track(&self, event: UsageEvent) -> Option<RecordReceipt> {
        match self.store.record(event.clone()).await {
            Ok(receipt) => Some(receipt),
            Err(e) if e.is_unavailable() => {
                warn!(
                    model = %event.model,
                    session_id = %event.session_id,
                    error = %e,
                    "Usage store unavailable, counting in memory"
                );
                self.fallback.add(&event);
                None
            }
            Err(e) => {
                error!(
                    model = %event.model,
                    session_id = %event.session_id,
                    error = %e,
                    kind = e.kind(),
                    "Usage event dropped"
                );
                None
            }
        }
    }

    /// Query the store; session queries also fold in fallback counts
    ///
    /// For `session`, a store outage yields the fallback counts alone with
    /// `degraded` set. Every other period surfaces store errors as-is.
    pub async fn usage(
        &self,
        period: Period,
        model: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<TrackedUsage> {
        let fallback = match (period, session_id) {
            (Period::Session, Some(id)) => Some(self.fallback.summary(id, model)),
            _ => None,
        };

        match self.store.query(period, model, session_id).await {
            Ok(summary) => Ok(match fallback {
                Some(extra) if !extra.is_empty() => TrackedUsage {
                    summary: summary.merged_with(&extra),
                    degraded: true,
                },
                _ => TrackedUsage {
                    summary,
                    degraded: false,
                },
            }),
            Err(e) if e.is_unavailable() && fallback.is_some() => {
                warn!(error = %e, "Usage store unavailable, reporting in-memory session counts");
                Ok(TrackedUsage {
                    summary: fallback.unwrap_or_else(|| UsageSummary::empty(period)),
                    degraded: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}
