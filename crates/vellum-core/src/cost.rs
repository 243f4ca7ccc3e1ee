//! Token and spend accounting snapshots.
//!
//! Snapshots are additive: the ledger owns the running totals, and
//! per-project accounting is expressed as the delta between two captured
//! snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An immutable view of accumulated token usage and estimated spend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    /// Total tokens recorded across all models.
    #[serde(default)]
    pub total_tokens: u64,
    /// Tokens recorded per model.
    #[serde(default)]
    pub tokens_by_model: BTreeMap<String, u64>,
    /// Number of provider calls recorded.
    #[serde(default)]
    pub api_calls: u64,
    /// Estimated spend in USD, from the static pricing table.
    #[serde(default)]
    pub estimated_cost_usd: f64,
}

impl CostSnapshot {
    /// Returns the delta of this snapshot against an earlier one.
    ///
    /// Counters are additive, so the delta is a well-formed snapshot for the
    /// interval between the two captures. Saturating: a restarted ledger
    /// never yields negative counts.
    #[must_use]
    pub fn delta(&self, earlier: &Self) -> Self {
        let mut tokens_by_model = BTreeMap::new();
        for (model, &tokens) in &self.tokens_by_model {
            let before = earlier.tokens_by_model.get(model).copied().unwrap_or(0);
            let diff = tokens.saturating_sub(before);
            if diff > 0 {
                tokens_by_model.insert(model.clone(), diff);
            }
        }
        Self {
            total_tokens: self.total_tokens.saturating_sub(earlier.total_tokens),
            tokens_by_model,
            api_calls: self.api_calls.saturating_sub(earlier.api_calls),
            estimated_cost_usd: (self.estimated_cost_usd - earlier.estimated_cost_usd).max(0.0),
        }
    }

    /// Returns true when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.api_calls == 0
    }
}
