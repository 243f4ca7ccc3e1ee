//! Pipeline progress tracking.
//!
//! A trace-id-scoped timer over the nine ordered stages. Every emission is
//! a structured `tracing` event carrying the project id, trace id, stage,
//! elapsed time since pipeline start and the stage duration; stage
//! durations are mirrored to the metrics facade.

use std::sync::Mutex;
use std::time::Instant;

use metrics::counter;
use serde::{Deserialize, Serialize};

use vellum_core::id::{ProjectId, TraceId};

use crate::metrics::{names, observe_stage_duration};

/// The ordered pipeline stages.
///
/// `AudioScript` is present only when the audio collaborator is enabled;
/// it slots in before `ManifestUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Transition to analyzing and resolve the working model.
    Init,
    /// High-priority script generation.
    ScriptGeneration,
    /// Trend store consultation.
    TrendAnalysis,
    /// Multi-region SEO generation.
    SeoGeneration,
    /// Low-priority short-form hook extraction.
    ShortsExtraction,
    /// Voice profile lookup.
    VoiceMatching,
    /// Bilingual narration script generation (audio mode only).
    AudioScript,
    /// Cost accounting and output persistence.
    ManifestUpdate,
    /// Hand-off transition and dedup marking.
    Finalization,
}

impl Stage {
    /// Snake_case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ScriptGeneration => "script_generation",
            Self::TrendAnalysis => "trend_analysis",
            Self::SeoGeneration => "seo_generation",
            Self::ShortsExtraction => "shorts_extraction",
            Self::VoiceMatching => "voice_matching",
            Self::AudioScript => "audio_script",
            Self::ManifestUpdate => "manifest_update",
            Self::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trace-scoped stage timer and event emitter.
pub struct ProgressTracker {
    project_id: ProjectId,
    trace_id: TraceId,
    pipeline_start: Instant,
    current: Mutex<Option<(Stage, Instant)>>,
}

impl ProgressTracker {
    /// Starts a tracker and emits the pipeline-start event.
    #[must_use]
    pub fn start(project_id: ProjectId, trace_id: TraceId) -> Self {
        tracing::info!(
            project_id = %project_id,
            trace_id = %trace_id,
            event = "pipeline_start",
            "pipeline started"
        );
        Self {
            project_id,
            trace_id,
            pipeline_start: Instant::now(),
            current: Mutex::new(None),
        }
    }

    /// Marks a stage as started.
    pub fn start_stage(&self, stage: Stage) {
        *self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some((stage, Instant::now()));
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage = stage.as_str(),
            elapsed_ms = self.elapsed_ms(),
            event = "stage_start",
            "stage started"
        );
    }

    /// Marks the current stage as complete with optional context.
    pub fn complete_stage(&self, stage: Stage, context: Option<serde_json::Value>) {
        let stage_ms = self.take_stage_ms(stage);
        observe_stage_duration(stage.as_str(), stage_ms as f64 / 1000.0);
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage = stage.as_str(),
            elapsed_ms = self.elapsed_ms(),
            stage_ms,
            context = %context.unwrap_or(serde_json::Value::Null),
            event = "stage_complete",
            "stage complete"
        );
    }

    /// Emits a sub-step inside the current stage.
    pub fn log_sub_step(&self, stage: Stage, step: &str) {
        tracing::debug!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage = stage.as_str(),
            elapsed_ms = self.elapsed_ms(),
            step,
            event = "sub_step",
            "sub-step"
        );
    }

    /// Emits the pipeline-complete event.
    pub fn log_pipeline_complete(&self) {
        counter!(names::PIPELINES_TOTAL, "outcome" => "complete").increment(1);
        tracing::info!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            elapsed_ms = self.elapsed_ms(),
            event = "pipeline_complete",
            "pipeline complete"
        );
    }

    /// Emits the pipeline-error event for a failed stage.
    pub fn log_pipeline_error(&self, stage: Stage, error: &vellum_core::error::Error) {
        counter!(names::PIPELINES_TOTAL, "outcome" => "error").increment(1);
        tracing::error!(
            project_id = %self.project_id,
            trace_id = %self.trace_id,
            stage = stage.as_str(),
            elapsed_ms = self.elapsed_ms(),
            error = %error,
            event = "pipeline_error",
            "pipeline failed"
        );
    }

    fn elapsed_ms(&self) -> u64 {
        self.pipeline_start.elapsed().as_millis() as u64
    }

    fn take_stage_ms(&self, stage: Stage) -> u64 {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match current.take() {
            Some((started_stage, at)) if started_stage == stage => at.elapsed().as_millis() as u64,
            other => {
                // Completion without a matching start; keep whatever was
                // running and report zero.
                *current = other;
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_stable() {
        assert_eq!(Stage::Init.as_str(), "init");
        assert_eq!(Stage::ScriptGeneration.as_str(), "script_generation");
        assert_eq!(Stage::Finalization.as_str(), "finalization");
    }

    #[test]
    fn tracker_runs_a_full_stage_cycle() {
        let tracker = ProgressTracker::start(ProjectId::generate(), TraceId::generate());
        tracker.start_stage(Stage::Init);
        tracker.log_sub_step(Stage::Init, "resolved model");
        tracker.complete_stage(Stage::Init, Some(serde_json::json!({"model": "gemini-2.5-pro"})));
        tracker.log_pipeline_complete();
    }

    #[test]
    fn mismatched_complete_reports_zero_duration() {
        let tracker = ProgressTracker::start(ProjectId::generate(), TraceId::generate());
        tracker.start_stage(Stage::Init);
        assert_eq!(tracker.take_stage_ms(Stage::Finalization), 0);
        // The running stage is preserved.
        assert!(tracker.take_stage_ms(Stage::Init) < 1000);
    }
}
