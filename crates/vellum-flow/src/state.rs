//! Project state machine: transitions, heartbeat, recovery, dead-letter.
//!
//! The state machine is the sole mutator of manifests. Every other
//! component receives manifests by value and mutates only through updater
//! closures re-persisted here. The cyclic reference to the pipeline driver
//! is broken by a recovery callback registered once at wiring time.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use vellum_core::config::{ModelSpec, StaleThresholds};
use vellum_core::content::AudioState;
use vellum_core::error::{Error, Result};
use vellum_core::fingerprint::{classify, should_degrade, ErrorFingerprint};
use vellum_core::id::{ProjectId, TraceId};
use vellum_core::jsonio;
use vellum_core::manifest::{ErrorRecord, Manifest, ProjectStatus};

use crate::manifest_store::ManifestStore;
use crate::metrics::names;

/// Invoked when a project should re-enter the pipeline. Registered once at
/// wiring time; implementations must not block.
pub type RecoveryCallback = Arc<dyn Fn(ProjectId) + Send + Sync>;

/// The audio collaborator surface polled by the heartbeat for
/// `pending_audio` projects.
#[async_trait]
pub trait AudioCollaborator: Send + Sync {
    /// Inspects the project directory and returns the updated slot state.
    async fn check_and_update(&self, project_dir: &std::path::Path, state: AudioState)
        -> AudioState;
}

/// Audio collaborator that never reports slots ready.
pub struct NoopAudio;

#[async_trait]
impl AudioCollaborator for NoopAudio {
    async fn check_and_update(
        &self,
        _project_dir: &std::path::Path,
        state: AudioState,
    ) -> AudioState {
        state
    }
}

/// One line in the NDJSON alert log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    /// The dead-lettered project.
    pub project_id: ProjectId,
    /// Its correlation id.
    pub trace_id: TraceId,
    /// Why the project was dead-lettered.
    pub reason: String,
    /// Fingerprint of the final failure, if one was classified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<ErrorFingerprint>,
    /// Retry count at dead-letter time.
    pub retry_count: u32,
    /// Models abandoned along the fallback chain.
    pub used_models: Vec<String>,
    /// When the alert was emitted.
    pub timestamp: DateTime<Utc>,
    /// Always `critical` for dead-letter alerts.
    pub severity: String,
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Retry cap before dead-letter.
    pub max_retries: u32,
    /// Stale recovery cap before the project is failed outright.
    pub max_stale_recoveries: u32,
    /// Per-status staleness thresholds.
    pub stale_thresholds: StaleThresholds,
    /// Directory for dead-letter manifest snapshots.
    pub dead_letter_dir: PathBuf,
    /// NDJSON alert log path.
    pub alerts_path: PathBuf,
    /// The model fallback chain.
    pub fallback_chain: Vec<ModelSpec>,
}

/// The project state machine.
pub struct StateMachine {
    store: ManifestStore,
    config: StateMachineConfig,
    recovery: RwLock<Option<RecoveryCallback>>,
    audio: Arc<dyn AudioCollaborator>,
}

impl StateMachine {
    /// Creates a state machine over a manifest store.
    #[must_use]
    pub fn new(
        store: ManifestStore,
        config: StateMachineConfig,
        audio: Arc<dyn AudioCollaborator>,
    ) -> Self {
        Self {
            store,
            config,
            recovery: RwLock::new(None),
            audio,
        }
    }

    /// Registers the on-recovered callback. Set once at wiring time.
    pub fn set_recovery_callback(&self, callback: RecoveryCallback) {
        *self
            .recovery
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    /// The manifest store facade handed to stage code.
    #[must_use]
    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Persists a new project manifest.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn create_project(&self, manifest: &Manifest) -> Result<()> {
        self.store.create(manifest)?;
        tracing::info!(
            project_id = %manifest.id,
            trace_id = %manifest.trace_id,
            path = %manifest.input_source.path.display(),
            language = manifest.input_source.language.as_str(),
            word_count = manifest.input_source.word_count,
            "project created"
        );
        Ok(())
    }

    /// Performs a checked transition and persists the manifest.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] when the target is not allowed from
    /// the current status.
    pub fn transition(&self, id: ProjectId, target: ProjectStatus) -> Result<Manifest> {
        let manifest = self.store.update(id, |m| {
            let from = m.status;
            m.transition(target)?;
            counter!(names::TRANSITIONS_TOTAL,
                "from" => from.as_str(), "to" => target.as_str())
            .increment(1);
            Ok(())
        })?;
        tracing::debug!(
            project_id = %id,
            trace_id = %manifest.trace_id,
            status = target.as_str(),
            "status transition"
        );
        Ok(manifest)
    }

    /// Routes a stage failure: degrade, retry or dead-letter.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures; the routing decision itself never
    /// fails.
    pub fn handle_error(&self, id: ProjectId, err: &Error, stage: &str) -> Result<()> {
        let fingerprint = classify(err);
        tracing::error!(
            project_id = %id,
            stage,
            kind = ?fingerprint.kind,
            code = %fingerprint.code,
            error = %err,
            "stage failed"
        );

        let manifest = self.store.update(id, |m| {
            m.meta.error_history.push(fingerprint.clone());
            m.meta.error_fingerprint = Some(fingerprint.clone());
            m.error = Some(ErrorRecord {
                stage: stage.to_string(),
                message: err.to_string(),
                retries: m.meta.retry_count,
                timestamp: Utc::now(),
                fallback_model_used: m
                    .meta
                    .is_fallback_mode
                    .then(|| m.meta.current_model.clone()),
            });
            Ok(())
        })?;

        let chain_len = self.config.fallback_chain.len();
        if should_degrade(&fingerprint, manifest.meta.used_models.len(), chain_len) {
            return self.attempt_degraded_retry(id);
        }

        let manifest = self.store.update(id, |m| {
            m.meta.retry_count += 1;
            Ok(())
        })?;

        if manifest.meta.retry_count >= self.config.max_retries {
            self.move_to_dead_letter(id, &format!("retry cap reached in stage {stage}"))
        } else {
            self.transition(id, ProjectStatus::Failed)?;
            Ok(())
        }
    }

    /// Advances the fallback chain and re-enters the pipeline.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn attempt_degraded_retry(&self, id: ProjectId) -> Result<()> {
        let manifest = self.store.load(id)?;
        let next_model = self
            .config
            .fallback_chain
            .iter()
            .find(|m| {
                !manifest.meta.used_models.contains(&m.name)
                    && m.name != manifest.meta.current_model
            })
            .cloned();

        let Some(next) = next_model else {
            return self.move_to_dead_letter(id, "fallback chain exhausted");
        };

        self.store.update(id, |m| {
            m.transition(ProjectStatus::DegradedRetry)?;
            let abandoned = std::mem::replace(&mut m.meta.current_model, next.name.clone());
            m.meta.used_models.push(abandoned);
            m.meta.is_degraded = next.strict;
            m.meta.is_fallback_mode = true;
            Ok(())
        })?;

        tracing::warn!(
            project_id = %id,
            model = %next.name,
            strict = next.strict,
            "degrading to next fallback model"
        );

        self.transition(id, ProjectStatus::Analyzing)?;
        self.invoke_recovery(id);
        Ok(())
    }

    /// Recovers a stale project, or fails it past the recovery cap.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn recover_stale(&self, id: ProjectId) -> Result<()> {
        let manifest = self.store.load(id)?;

        if manifest.meta.stale_recovery_count >= self.config.max_stale_recoveries {
            let cap = self.config.max_stale_recoveries;
            self.store.update(id, |m| {
                let err = Error::RecoveryExhausted {
                    count: m.meta.stale_recovery_count,
                };
                let fingerprint = classify(&err);
                m.meta.error_history.push(fingerprint.clone());
                m.meta.error_fingerprint = Some(fingerprint);
                m.error = Some(ErrorRecord {
                    stage: "heartbeat".to_string(),
                    message: format!("stale recovery cap ({cap}) reached"),
                    retries: m.meta.retry_count,
                    timestamp: Utc::now(),
                    fallback_model_used: None,
                });
                m.transition(ProjectStatus::Failed)?;
                Ok(())
            })?;
            tracing::error!(project_id = %id, "stale recovery cap reached; project failed");
            return Ok(());
        }

        self.store.update(id, |m| {
            m.meta.stale_recovery_count += 1;
            m.transition(ProjectStatus::StaleRecovered)?;
            Ok(())
        })?;
        counter!(names::STALE_RECOVERIES_TOTAL).increment(1);

        self.transition(id, ProjectStatus::Pending)?;
        tracing::warn!(project_id = %id, "stale project recovered; re-queued");
        self.invoke_recovery(id);
        Ok(())
    }

    /// Moves a project to the terminal dead-letter state: snapshot,
    /// NDJSON alert, no-op external dispatch.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn move_to_dead_letter(&self, id: ProjectId, reason: &str) -> Result<()> {
        let manifest = self.store.update(id, |m| {
            m.transition(ProjectStatus::DeadLetter)?;
            m.meta.is_dead_letter = true;
            Ok(())
        })?;
        counter!(names::DEAD_LETTERS_TOTAL).increment(1);

        let snapshot_path = self.config.dead_letter_dir.join(format!(
            "{}_{}.json",
            id,
            manifest.updated_at.timestamp()
        ));
        jsonio::write_json_atomic(&snapshot_path, &manifest)?;

        let alert = AlertRecord {
            project_id: id,
            trace_id: manifest.trace_id,
            reason: reason.to_string(),
            fingerprint: manifest.meta.error_fingerprint.clone(),
            retry_count: manifest.meta.retry_count,
            used_models: manifest.meta.used_models.clone(),
            timestamp: Utc::now(),
            severity: "critical".to_string(),
        };
        jsonio::append_json_line(&self.config.alerts_path, &alert)?;
        Self::dispatch_alert(&alert);

        tracing::error!(
            project_id = %id,
            trace_id = %manifest.trace_id,
            reason,
            snapshot = %snapshot_path.display(),
            "project dead-lettered"
        );
        Ok(())
    }

    /// External alert dispatch integration point; deliberately a no-op.
    fn dispatch_alert(_alert: &AlertRecord) {}

    /// One heartbeat sweep over every non-terminal manifest.
    ///
    /// Per-project failures are logged and do not stop the sweep;
    /// recovery callbacks fire asynchronously.
    pub async fn heartbeat_tick(&self) {
        let ids = match self.store.list_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat could not list projects");
                return;
            }
        };

        for id in ids {
            if let Err(e) = self.heartbeat_project(id).await {
                tracing::warn!(project_id = %id, error = %e, "heartbeat check failed");
            }
        }
    }

    async fn heartbeat_project(&self, id: ProjectId) -> Result<()> {
        let manifest = self.store.load(id)?;
        if manifest.status.is_terminal() {
            return Ok(());
        }

        if manifest.status == ProjectStatus::PendingAudio {
            return self.probe_audio(&manifest).await;
        }

        let Some(threshold) = self.config.stale_thresholds.for_status(manifest.status) else {
            return Ok(());
        };

        let age = Utc::now().signed_duration_since(manifest.updated_at);
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        if age > threshold {
            tracing::warn!(
                project_id = %id,
                status = manifest.status.as_str(),
                age_secs = age.num_seconds(),
                "stale project detected"
            );
            self.recover_stale(id)?;
        }
        Ok(())
    }

    async fn probe_audio(&self, manifest: &Manifest) -> Result<()> {
        let project_dir = self.store.project_dir(manifest.id);
        let current = manifest.content_engine.audio.clone().unwrap_or_default();
        let updated = self.audio.check_and_update(&project_dir, current).await;

        let all_ready = updated.all_ready();
        self.store.update(manifest.id, |m| {
            m.content_engine.audio = Some(updated.clone());
            Ok(())
        })?;

        if all_ready {
            tracing::info!(project_id = %manifest.id, "all audio slots ready");
            self.transition(manifest.id, ProjectStatus::Rendering)?;
        }
        Ok(())
    }

    fn invoke_recovery(&self, id: ProjectId) {
        let callback = self
            .recovery
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(id),
            None => tracing::warn!(project_id = %id, "no recovery callback registered"),
        }
    }
}
