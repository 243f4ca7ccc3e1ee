//! Observability metrics for the orchestration domain.
//!
//! Exposed via the `metrics` crate facade; names are constants so emitters
//! and dashboards stay consistent.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `vellum_flow_stage_duration_seconds` | Histogram | `stage` | Stage execution time |
//! | `vellum_flow_pipelines_total` | Counter | `outcome` | Pipeline completions by outcome |
//! | `vellum_flow_transitions_total` | Counter | `from`, `to` | Manifest status transitions |
//! | `vellum_flow_stale_recoveries_total` | Counter | - | Heartbeat-initiated recoveries |
//! | `vellum_flow_dead_letters_total` | Counter | - | Projects moved to dead-letter |
//! | `vellum_flow_documents_ingested_total` | Counter | `language` | Accepted documents |
//! | `vellum_flow_duplicates_skipped_total` | Counter | `method` | Dedup hits |

use std::time::Instant;

use metrics::histogram;

/// Metric names as constants for consistency.
pub mod names {
    /// Histogram: stage execution time in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "vellum_flow_stage_duration_seconds";
    /// Counter: pipeline completions by outcome.
    pub const PIPELINES_TOTAL: &str = "vellum_flow_pipelines_total";
    /// Counter: manifest status transitions.
    pub const TRANSITIONS_TOTAL: &str = "vellum_flow_transitions_total";
    /// Counter: heartbeat-initiated stale recoveries.
    pub const STALE_RECOVERIES_TOTAL: &str = "vellum_flow_stale_recoveries_total";
    /// Counter: projects moved to dead-letter.
    pub const DEAD_LETTERS_TOTAL: &str = "vellum_flow_dead_letters_total";
    /// Counter: documents accepted by the watcher.
    pub const DOCUMENTS_INGESTED_TOTAL: &str = "vellum_flow_documents_ingested_total";
    /// Counter: duplicate documents skipped.
    pub const DUPLICATES_SKIPPED_TOTAL: &str = "vellum_flow_duplicates_skipped_total";
}

/// Records a duration histogram when dropped.
pub struct TimingGuard<F: Fn(f64)> {
    started: Instant,
    record: F,
}

impl<F: Fn(f64)> TimingGuard<F> {
    /// Starts timing; `record` receives elapsed seconds on drop.
    pub fn new(record: F) -> Self {
        Self {
            started: Instant::now(),
            record,
        }
    }
}

impl<F: Fn(f64)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        (self.record)(self.started.elapsed().as_secs_f64());
    }
}

/// Records one stage duration.
pub fn observe_stage_duration(stage: &str, seconds: f64) {
    histogram!(names::STAGE_DURATION_SECONDS, "stage" => stage.to_string()).record(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_guard_records_on_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let fired = AtomicBool::new(false);
        {
            let _guard = TimingGuard::new(|_| fired.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
