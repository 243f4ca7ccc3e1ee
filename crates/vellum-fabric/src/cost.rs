//! Per-model token accounting.
//!
//! The ledger owns the global counters; per-project accounting is the delta
//! between two [`CostSnapshot`] captures. Each record schedules a
//! best-effort persist of the snapshot to the cost report file.

use std::path::PathBuf;
use std::sync::Mutex;

use vellum_core::cost::CostSnapshot;
use vellum_core::jsonio;

/// USD per million tokens, by model. Unknown models price at the chain
/// head's rate.
const PRICING_USD_PER_MTOK: &[(&str, f64)] = &[
    ("gemini-2.5-pro", 3.50),
    ("gemini-2.5-flash", 0.35),
    ("gemini-2.0-flash-lite", 0.10),
];

const DEFAULT_USD_PER_MTOK: f64 = 3.50;

fn price_per_mtok(model: &str) -> f64 {
    PRICING_USD_PER_MTOK
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(DEFAULT_USD_PER_MTOK, |(_, price)| *price)
}

/// Process-owned cost ledger.
#[derive(Debug)]
pub struct CostLedger {
    state: Mutex<CostSnapshot>,
    report_path: Option<PathBuf>,
}

impl CostLedger {
    /// Creates a ledger persisting to the given report file.
    #[must_use]
    pub fn new(report_path: PathBuf) -> Self {
        // Resume counters from a previous run when a report exists.
        let initial = jsonio::read_json::<CostSnapshot>(&report_path).unwrap_or_default();
        Self {
            state: Mutex::new(initial),
            report_path: Some(report_path),
        }
    }

    /// Creates an in-memory ledger (tests).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(CostSnapshot::default()),
            report_path: None,
        }
    }

    /// Records one provider call.
    ///
    /// Updates totals, the per-model breakdown, the call count and the
    /// dollar estimate, then schedules an async best-effort persist.
    pub fn record(&self, model: &str, tokens: u64) {
        let snapshot = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.total_tokens += tokens;
            *state.tokens_by_model.entry(model.to_string()).or_insert(0) += tokens;
            state.api_calls += 1;
            state.estimated_cost_usd += tokens as f64 * price_per_mtok(model) / 1_000_000.0;
            state.clone()
        };

        if let Some(path) = self.report_path.clone() {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = jsonio::write_json_atomic(&path, &snapshot) {
                    tracing::warn!(error = %e, path = %path.display(), "cost report persist failed");
                }
            });
        }
    }

    /// An immutable view of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> CostSnapshot {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Persists the current snapshot synchronously (shutdown path).
    ///
    /// # Errors
    ///
    /// Returns the underlying filesystem error.
    pub fn flush(&self) -> vellum_core::error::Result<()> {
        if let Some(path) = &self.report_path {
            jsonio::write_json_atomic(path, &self.snapshot())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_accumulates() {
        let ledger = CostLedger::in_memory();
        ledger.record("gemini-2.5-pro", 1000);
        ledger.record("gemini-2.5-flash", 500);
        ledger.record("gemini-2.5-pro", 250);

        let snap = ledger.snapshot();
        assert_eq!(snap.total_tokens, 1750);
        assert_eq!(snap.api_calls, 3);
        assert_eq!(snap.tokens_by_model.get("gemini-2.5-pro"), Some(&1250));
        assert!(snap.estimated_cost_usd > 0.0);
    }

    #[tokio::test]
    async fn pricing_differs_by_model() {
        let pro = CostLedger::in_memory();
        pro.record("gemini-2.5-pro", 1_000_000);
        let lite = CostLedger::in_memory();
        lite.record("gemini-2.0-flash-lite", 1_000_000);
        assert!(pro.snapshot().estimated_cost_usd > lite.snapshot().estimated_cost_usd);
    }

    #[tokio::test]
    async fn flush_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost_report.json");
        let ledger = CostLedger::new(path.clone());
        ledger.record("gemini-2.5-pro", 42);
        ledger.flush().unwrap();

        let report: CostSnapshot = jsonio::read_json(&path).unwrap();
        assert_eq!(report.total_tokens, 42);
    }

    #[tokio::test]
    async fn ledger_resumes_from_existing_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost_report.json");
        {
            let ledger = CostLedger::new(path.clone());
            ledger.record("gemini-2.5-pro", 100);
            ledger.flush().unwrap();
        }
        let resumed = CostLedger::new(path);
        assert_eq!(resumed.snapshot().total_tokens, 100);
    }
}
