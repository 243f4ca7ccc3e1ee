//! The per-project pipeline driver.
//!
//! Runs the ordered stages against one project, bracketing each with the
//! progress tracker. Stage failures are forwarded to the state machine's
//! error handler, which decides degrade / retry / dead-letter; the driver
//! itself never retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use vellum_core::content::{AudioSlotStatus, AudioState, Script};
use vellum_core::cost::CostSnapshot;
use vellum_core::error::Error;
use vellum_core::id::ProjectId;
use vellum_core::manifest::{Manifest, ProjectStatus};
use vellum_core::observability::pipeline_span;

use vellum_fabric::fabric::{GenerateOptions, LlmFabric};
use vellum_fabric::queue::Priority;

use crate::content;
use crate::hash_index::HashIndex;
use crate::progress::{ProgressTracker, Stage};
use crate::state::StateMachine;
use crate::trend::TrendStore;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Retry attempts per model for fabric calls.
    pub max_retries: u32,
    /// Whether the audio collaborator stages run.
    pub audio_enabled: bool,
    /// Language slots the audio collaborator must fill.
    pub audio_languages: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            audio_enabled: false,
            audio_languages: vec!["en".to_string(), "zh".to_string()],
        }
    }
}

/// Per-project token usage accumulated across stages.
#[derive(Debug, Default)]
struct LocalUsage {
    total_tokens: u64,
    tokens_by_model: BTreeMap<String, u64>,
}

impl LocalUsage {
    fn record(&mut self, model: &str, tokens: u64) {
        self.total_tokens += tokens;
        *self.tokens_by_model.entry(model.to_string()).or_insert(0) += tokens;
    }
}

/// Orchestrates the pipeline stages for single projects.
pub struct PipelineDriver {
    state: Arc<StateMachine>,
    fabric: Arc<LlmFabric>,
    trends: Arc<TrendStore>,
    hash_index: Arc<HashIndex>,
    config: PipelineConfig,
}

impl PipelineDriver {
    /// Wires the driver over its collaborators.
    #[must_use]
    pub fn new(
        state: Arc<StateMachine>,
        fabric: Arc<LlmFabric>,
        trends: Arc<TrendStore>,
        hash_index: Arc<HashIndex>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            state,
            fabric,
            trends,
            hash_index,
            config,
        }
    }

    /// Accepts a ready document: dedup check, then project creation.
    ///
    /// Returns the new project id, or `None` for duplicates and intake
    /// failures (both logged; the document file stays in the processed
    /// subtree either way).
    pub async fn ingest(&self, document: crate::ingress::ReadyDocument) -> Option<ProjectId> {
        use metrics::counter;

        let check = match self.hash_index.is_processed(&document.path).await {
            Ok(check) => check,
            Err(e) => {
                tracing::error!(path = %document.path.display(), error = %e, "dedup check failed");
                return None;
            }
        };

        if check.processed {
            let existing = check.existing.as_ref().map(|e| e.project_id.to_string());
            counter!(crate::metrics::names::DUPLICATES_SKIPPED_TOTAL,
                "method" => "hash_match")
            .increment(1);
            tracing::info!(
                path = %document.path.display(),
                existing_project = existing.as_deref().unwrap_or("unknown"),
                "duplicate document skipped"
            );
            return None;
        }

        let hash = match check.hash {
            Some(hash) => hash,
            None => match crate::hash_index::hash_file(&document.path) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::error!(path = %document.path.display(), error = %e, "hashing failed");
                    return None;
                }
            },
        };

        let head_model = self
            .fabric
            .fallback_chain()
            .first()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        let mut manifest = Manifest::new(
            vellum_core::manifest::InputSource {
                path: document.path.clone(),
                content: document.content,
                language: document.language,
                word_count: document.word_count,
                reading_time_seconds: document.reading_time_seconds,
            },
            head_model,
        );
        manifest.meta.content_hash = Some(hash);

        match self.state.create_project(&manifest) {
            Ok(()) => Some(manifest.id),
            Err(e) => {
                tracing::error!(path = %document.path.display(), error = %e, "project creation failed");
                None
            }
        }
    }

    /// Runs the pipeline for one project; failures are routed to the
    /// state machine and never propagate out of the driver.
    pub async fn run(&self, id: ProjectId) {
        use tracing::Instrument;

        let manifest = match self.state.store().load(id) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(project_id = %id, error = %e, "pipeline could not load manifest");
                return;
            }
        };
        let span = pipeline_span("run", &id.to_string(), &manifest.trace_id.to_string());
        self.drive(id, manifest).instrument(span).await;
    }

    async fn drive(&self, id: ProjectId, manifest: Manifest) {
        let tracker = ProgressTracker::start(id, manifest.trace_id);
        match self.execute(&tracker, manifest).await {
            Ok(()) => tracker.log_pipeline_complete(),
            Err((stage, err)) => {
                tracker.log_pipeline_error(stage, &err);
                if let Err(handler_err) = self.state.handle_error(id, &err, stage.as_str()) {
                    tracing::error!(
                        project_id = %id,
                        stage = stage.as_str(),
                        error = %handler_err,
                        "error handler itself failed"
                    );
                }
            }
        }
    }

    async fn execute(
        &self,
        tracker: &ProgressTracker,
        manifest: Manifest,
    ) -> std::result::Result<(), (Stage, Error)> {
        let id = manifest.id;
        let global_start = self.fabric.ledger().snapshot();
        let mut usage = LocalUsage::default();

        // INIT: enter analyzing and resolve the working model. A project
        // re-entering from degraded retry is already analyzing.
        tracker.start_stage(Stage::Init);
        if manifest.status == ProjectStatus::Pending {
            self.state
                .transition(id, ProjectStatus::Analyzing)
                .map_err(|e| (Stage::Init, e))?;
        }
        let current_model = manifest.meta.current_model.clone();
        let degraded = manifest.meta.is_degraded;
        tracker.complete_stage(
            Stage::Init,
            Some(serde_json::json!({ "model": current_model, "degraded": degraded })),
        );

        // SCRIPT_GENERATION at high priority.
        tracker.start_stage(Stage::ScriptGeneration);
        let script = self
            .script_stage(tracker, &manifest, &current_model, &mut usage)
            .await
            .map_err(|e| (Stage::ScriptGeneration, e))?;
        tracker.complete_stage(
            Stage::ScriptGeneration,
            Some(serde_json::json!({
                "segments": script.segments.len(),
                "estimated_duration_seconds": script.estimated_duration_seconds(),
            })),
        );

        // TREND_ANALYSIS over the script's topic.
        tracker.start_stage(Stage::TrendAnalysis);
        let trend_keywords: Vec<String> = self
            .trends
            .get_hot(&script.title)
            .await
            .map_err(|e| (Stage::TrendAnalysis, e))?
            .into_iter()
            .map(|entry| entry.keyword)
            .collect();
        tracker.complete_stage(
            Stage::TrendAnalysis,
            Some(serde_json::json!({ "keywords": trend_keywords.len() })),
        );

        // SEO_GENERATION.
        tracker.start_stage(Stage::SeoGeneration);
        let seo = self
            .seo_stage(&manifest, &script, &trend_keywords, &current_model, &mut usage)
            .await
            .map_err(|e| (Stage::SeoGeneration, e))?;
        tracker.complete_stage(
            Stage::SeoGeneration,
            Some(serde_json::json!({ "regions": seo.regions.len() })),
        );

        // SHORTS_EXTRACTION at low priority.
        tracker.start_stage(Stage::ShortsExtraction);
        let shorts = self
            .shorts_stage(&manifest, &script, &current_model, &mut usage)
            .await
            .map_err(|e| (Stage::ShortsExtraction, e))?;
        tracker.complete_stage(
            Stage::ShortsExtraction,
            Some(serde_json::json!({ "hooks": shorts.len() })),
        );

        // VOICE_MATCHING is a pure lookup.
        tracker.start_stage(Stage::VoiceMatching);
        let voice = content::match_voice(manifest.input_source.language);
        tracker.complete_stage(
            Stage::VoiceMatching,
            Some(serde_json::json!({ "voice_id": voice.voice_id })),
        );

        // AUDIO_SCRIPT: bilingual narration siblings for the collaborator.
        let audio_state = if self.config.audio_enabled {
            tracker.start_stage(Stage::AudioScript);
            let mut state = AudioState::default();
            for language in &self.config.audio_languages {
                let markdown = content::narration_markdown(&script, language);
                let file_name = format!("notebooklm_script_{language}.md");
                self.state
                    .store()
                    .write_sibling(id, &file_name, &markdown)
                    .map_err(|e| (Stage::AudioScript, e))?;
                state
                    .slots
                    .insert(language.clone(), AudioSlotStatus::Pending);
                tracker.log_sub_step(Stage::AudioScript, &file_name);
            }
            tracker.complete_stage(
                Stage::AudioScript,
                Some(serde_json::json!({ "languages": self.config.audio_languages })),
            );
            Some(state)
        } else {
            None
        };

        // MANIFEST_UPDATE: cost delta plus accumulated outputs.
        tracker.start_stage(Stage::ManifestUpdate);
        let global_end = self.fabric.ledger().snapshot();
        let global_delta = global_end.delta(&global_start);
        // Token counts come from the local per-stage accumulator while the
        // call count comes from the global ledger delta; concurrent
        // projects may interleave into the latter. Preserved as-is from
        // the original accounting.
        let cost = CostSnapshot {
            total_tokens: usage.total_tokens,
            tokens_by_model: usage.tokens_by_model.clone(),
            api_calls: global_delta.api_calls,
            estimated_cost_usd: global_delta.estimated_cost_usd,
        };
        self.state
            .store()
            .update(id, |m| {
                m.content_engine.script = Some(script.clone());
                m.content_engine.seo = Some(seo.clone());
                m.content_engine.shorts = shorts.clone();
                m.content_engine.voice_profile = Some(voice.clone());
                m.content_engine.audio = audio_state.clone();
                m.meta.cost = cost.clone();
                Ok(())
            })
            .map_err(|e| (Stage::ManifestUpdate, e))?;
        tracker.complete_stage(
            Stage::ManifestUpdate,
            Some(serde_json::json!({
                "tokens_used": cost.total_tokens,
                "api_calls": cost.api_calls,
            })),
        );

        // FINALIZATION: hand off and mark the input processed.
        tracker.start_stage(Stage::Finalization);
        let target = if self.config.audio_enabled {
            ProjectStatus::PendingAudio
        } else {
            ProjectStatus::Rendering
        };
        self.state
            .transition(id, target)
            .map_err(|e| (Stage::Finalization, e))?;

        let hash = match manifest.meta.content_hash.clone() {
            Some(hash) => hash,
            None => crate::hash_index::hash_file(&manifest.input_source.path)
                .map_err(|e| (Stage::Finalization, e))?,
        };
        let size = std::fs::metadata(&manifest.input_source.path)
            .map(|m| m.len())
            .unwrap_or(manifest.input_source.content.len() as u64);
        self.hash_index
            .mark_processed(&manifest.input_source.path, &hash, size, id)
            .await
            .map_err(|e| (Stage::Finalization, e))?;
        tracker.complete_stage(
            Stage::Finalization,
            Some(serde_json::json!({ "status": target.as_str() })),
        );

        Ok(())
    }

    async fn script_stage(
        &self,
        tracker: &ProgressTracker,
        manifest: &Manifest,
        current_model: &str,
        usage: &mut LocalUsage,
    ) -> vellum_core::error::Result<Script> {
        let prompt = content::script_prompt(&manifest.input_source);
        let outcome = self
            .fabric
            .generate(
                &prompt,
                &GenerateOptions {
                    project_id: manifest.id,
                    trace_id: manifest.trace_id,
                    priority: Priority::High,
                    max_retries: self.config.max_retries,
                    preferred_model: Some(current_model.to_string()),
                },
            )
            .await?;
        usage.record(&outcome.model_used, outcome.tokens_used);
        tracker.log_sub_step(Stage::ScriptGeneration, &format!("model {}", outcome.model_used));

        let value = content::parse_llm_json(&outcome.text, "script")?;
        vellum_core::content::parse_script(&value)
    }

    async fn seo_stage(
        &self,
        manifest: &Manifest,
        script: &Script,
        trend_keywords: &[String],
        current_model: &str,
        usage: &mut LocalUsage,
    ) -> vellum_core::error::Result<vellum_core::content::SeoPackage> {
        let prompt = content::seo_prompt(script, trend_keywords);
        let outcome = self
            .fabric
            .generate(
                &prompt,
                &GenerateOptions {
                    project_id: manifest.id,
                    trace_id: manifest.trace_id,
                    priority: Priority::Medium,
                    max_retries: self.config.max_retries,
                    preferred_model: Some(current_model.to_string()),
                },
            )
            .await?;
        usage.record(&outcome.model_used, outcome.tokens_used);

        let value = content::parse_llm_json(&outcome.text, "seo")?;
        content::parse_seo(&value, trend_keywords)
    }

    async fn shorts_stage(
        &self,
        manifest: &Manifest,
        script: &Script,
        current_model: &str,
        usage: &mut LocalUsage,
    ) -> vellum_core::error::Result<Vec<vellum_core::content::ShortHook>> {
        let prompt = content::shorts_prompt(script);
        let outcome = self
            .fabric
            .generate(
                &prompt,
                &GenerateOptions {
                    project_id: manifest.id,
                    trace_id: manifest.trace_id,
                    priority: Priority::Low,
                    max_retries: self.config.max_retries,
                    preferred_model: Some(current_model.to_string()),
                },
            )
            .await?;
        usage.record(&outcome.model_used, outcome.tokens_used);

        let value = content::parse_llm_json(&outcome.text, "shorts")?;
        content::parse_shorts(&value)
    }
}
