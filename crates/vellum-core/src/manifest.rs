//! The durable per-project manifest and its status machine vocabulary.
//!
//! A manifest is the single hand-off artifact to downstream renderers: one
//! JSON file per project, rewritten whole on every mutation, validated on
//! every load. The status enum and its transition table live here with the
//! data; the state machine in `vellum-flow` enforces them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::content::{ContentEngine, Language};
use crate::cost::CostSnapshot;
use crate::error::{Error, Result};
use crate::fingerprint::ErrorFingerprint;
use crate::id::{ProjectId, TraceId};
use crate::validate::{IssueCode, IssueList};

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Accepted, waiting for a pipeline slot.
    Pending,
    /// Pipeline stages are executing.
    Analyzing,
    /// Waiting for the audio collaborator's language slots.
    PendingAudio,
    /// Handed off to the renderer.
    Rendering,
    /// Render output being uploaded.
    Uploading,
    /// Terminal success.
    Completed,
    /// Recoverable failure; eligible to re-enter as pending.
    Failed,
    /// Reset by stale recovery; immediately re-queued.
    StaleRecovered,
    /// Waiting to re-enter the pipeline on the next fallback model.
    DegradedRetry,
    /// Terminal failure with snapshot and alert emitted.
    DeadLetter,
}

impl ProjectStatus {
    /// Statuses this one may transition to. Empty means terminal.
    #[must_use]
    pub const fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Analyzing],
            Self::Analyzing => &[
                Self::PendingAudio,
                Self::Rendering,
                Self::Failed,
                Self::StaleRecovered,
                Self::DegradedRetry,
                Self::DeadLetter,
            ],
            Self::PendingAudio => &[
                Self::Rendering,
                Self::Failed,
                Self::StaleRecovered,
                Self::DeadLetter,
            ],
            Self::Rendering => &[
                Self::Uploading,
                Self::Failed,
                Self::StaleRecovered,
                Self::DeadLetter,
            ],
            Self::Uploading => &[
                Self::Completed,
                Self::Failed,
                Self::StaleRecovered,
                Self::DeadLetter,
            ],
            Self::Failed => &[Self::Pending, Self::DeadLetter],
            Self::StaleRecovered => &[Self::Pending],
            Self::DegradedRetry => &[Self::Analyzing, Self::Failed, Self::DeadLetter],
            Self::Completed | Self::DeadLetter => &[],
        }
    }

    /// Returns true when `target` is a legal next status.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }

    /// Snake_case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::PendingAudio => "pending_audio",
            Self::Rendering => "rendering",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::StaleRecovered => "stale_recovered",
            Self::DegradedRetry => "degraded_retry",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable description of an ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSource {
    /// Path the document was ingested from (post-move, in the processed
    /// subtree).
    pub path: PathBuf,
    /// Raw document text.
    pub content: String,
    /// Detected language.
    pub language: Language,
    /// Word count under the detected language's counting rule.
    pub word_count: usize,
    /// Estimated reading time in seconds.
    pub reading_time_seconds: u64,
}

/// The last-known failure of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Pipeline stage the failure surfaced in.
    pub stage: String,
    /// Failure description.
    pub message: String,
    /// Retry count at the time of failure.
    pub retries: u32,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Model active when the failure occurred, if a fallback was in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model_used: Option<String>,
}

/// Mutable bookkeeping for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    /// Failed attempts so far; bounded by the configured maximum except in
    /// dead-letter.
    #[serde(default)]
    pub retry_count: u32,
    /// Stale recoveries performed so far.
    #[serde(default)]
    pub stale_recovery_count: u32,
    /// Models already abandoned, in fallback-chain order.
    #[serde(default)]
    pub used_models: Vec<String>,
    /// Model the next attempt will use.
    #[serde(default)]
    pub current_model: String,
    /// True once any fallback model is active.
    #[serde(default)]
    pub is_fallback_mode: bool,
    /// True when the active model is a strict model requiring the expanded
    /// degradation prompt.
    #[serde(default)]
    pub is_degraded: bool,
    /// True once the project is dead-lettered.
    #[serde(default)]
    pub is_dead_letter: bool,
    /// Per-project cost snapshot (delta against the global ledger).
    #[serde(default)]
    pub cost: CostSnapshot,
    /// Append-only trail of classified failures.
    #[serde(default)]
    pub error_history: Vec<ErrorFingerprint>,
    /// Fingerprint of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_fingerprint: Option<ErrorFingerprint>,
    /// SHA-256 of the source document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// The durable record of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Unique project id; names the manifest directory.
    pub id: ProjectId,
    /// Correlation id threaded through logs and downstream calls.
    pub trace_id: TraceId,
    /// Current lifecycle status.
    pub status: ProjectStatus,
    /// When the project was created.
    pub created_at: DateTime<Utc>,
    /// When the manifest was last persisted; also the staleness clock.
    pub updated_at: DateTime<Utc>,
    /// The ingested document.
    pub input_source: InputSource,
    /// Mutable bookkeeping.
    #[serde(default)]
    pub meta: ProjectMeta,
    /// Accumulated pipeline outputs.
    #[serde(default)]
    pub content_engine: ContentEngine,
    /// Last-known failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl Manifest {
    /// Creates a new pending manifest for an ingested document.
    #[must_use]
    pub fn new(input_source: InputSource, initial_model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::generate(),
            trace_id: TraceId::generate(),
            status: ProjectStatus::Pending,
            created_at: now,
            updated_at: now,
            input_source,
            meta: ProjectMeta {
                current_model: initial_model.into(),
                ..ProjectMeta::default()
            },
            content_engine: ContentEngine::default(),
            error: None,
        }
    }

    /// Validates manifest invariants after a load.
    ///
    /// Serde already rejects unknown statuses and malformed enums; this
    /// checks the cross-field rules: timestamp ordering, the retry bound,
    /// the stale-recovery bound, and fallback-chain prefix ordering.
    pub fn validate(&self, max_retries: u32, fallback_chain: &[String]) -> Result<()> {
        let mut list = IssueList::new();

        if self.updated_at < self.created_at {
            list.push(
                IssueCode::TooSmall,
                "updated_at",
                "updated_at precedes created_at",
            );
        }

        if self.meta.retry_count > max_retries && self.status != ProjectStatus::DeadLetter {
            list.push(
                IssueCode::TooBig,
                "meta.retry_count",
                format!(
                    "retry_count {} exceeds {max_retries} outside dead_letter",
                    self.meta.retry_count
                ),
            );
        }

        if self.meta.used_models.len() > fallback_chain.len() {
            list.push(
                IssueCode::TooBig,
                "meta.used_models",
                "more used models than the fallback chain holds",
            );
        } else {
            for (i, used) in self.meta.used_models.iter().enumerate() {
                if fallback_chain.get(i) != Some(used) {
                    list.push(
                        IssueCode::InvalidLiteral,
                        format!("meta.used_models[{i}]"),
                        format!("'{used}' breaks fallback-chain prefix order"),
                    );
                    break;
                }
            }
        }

        if !self.meta.current_model.is_empty()
            && self.meta.used_models.contains(&self.meta.current_model)
        {
            list.push(
                IssueCode::InvalidLiteral,
                "meta.current_model",
                "current model appears in used_models",
            );
        }

        list.finish()
    }

    /// Marks the manifest as touched now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Performs a checked status transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when the target is not in the
    /// current status's allowed set.
    pub fn transition(&mut self, target: ProjectStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> InputSource {
        InputSource {
            path: PathBuf::from("processed/doc.md"),
            content: "hello world".into(),
            language: Language::En,
            word_count: 2,
            reading_time_seconds: 1,
        }
    }

    fn chain() -> Vec<String> {
        vec![
            "gemini-2.5-pro".to_string(),
            "gemini-2.5-flash".to_string(),
            "gemini-2.0-flash-lite".to_string(),
        ]
    }

    #[test]
    fn new_manifest_is_pending() {
        let m = Manifest::new(input(), "gemini-2.5-pro");
        assert_eq!(m.status, ProjectStatus::Pending);
        assert!(m.validate(3, &chain()).is_ok());
    }

    #[test]
    fn transition_table_allows_documented_paths() {
        use ProjectStatus::*;
        assert!(Pending.can_transition_to(Analyzing));
        assert!(!Pending.can_transition_to(Rendering));
        assert!(Analyzing.can_transition_to(DegradedRetry));
        assert!(Failed.can_transition_to(Pending));
        assert!(StaleRecovered.can_transition_to(Pending));
        assert!(!StaleRecovered.can_transition_to(Analyzing));
        assert!(DegradedRetry.can_transition_to(Analyzing));
        assert!(Completed.allowed_transitions().is_empty());
        assert!(DeadLetter.allowed_transitions().is_empty());
    }

    #[test]
    fn illegal_transition_is_typed_error() {
        let mut m = Manifest::new(input(), "gemini-2.5-pro");
        let err = m.transition(ProjectStatus::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(m.status, ProjectStatus::Pending);
    }

    #[test]
    fn transition_stamps_updated_at() {
        let mut m = Manifest::new(input(), "gemini-2.5-pro");
        let before = m.updated_at;
        m.transition(ProjectStatus::Analyzing).unwrap();
        assert!(m.updated_at >= before);
    }

    #[test]
    fn retry_bound_enforced_outside_dead_letter() {
        let mut m = Manifest::new(input(), "gemini-2.5-pro");
        m.meta.retry_count = 4;
        assert!(m.validate(3, &chain()).is_err());
        m.status = ProjectStatus::DeadLetter;
        assert!(m.validate(3, &chain()).is_ok());
    }

    #[test]
    fn used_models_must_be_chain_prefix() {
        let mut m = Manifest::new(input(), "gemini-2.0-flash-lite");
        m.meta.used_models = vec!["gemini-2.5-pro".into(), "gemini-2.5-flash".into()];
        assert!(m.validate(3, &chain()).is_ok());

        m.meta.used_models = vec!["gemini-2.5-flash".into()];
        assert!(m.validate(3, &chain()).is_err());
    }

    #[test]
    fn current_model_never_in_used_models() {
        let mut m = Manifest::new(input(), "gemini-2.5-pro");
        m.meta.used_models = vec!["gemini-2.5-pro".into()];
        assert!(m.validate(3, &chain()).is_err());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let m = Manifest::new(input(), "gemini-2.5-pro");
        let json = serde_json::to_string_pretty(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn unknown_status_is_rejected_by_serde() {
        let m = Manifest::new(input(), "gemini-2.5-pro");
        let mut value = serde_json::to_value(&m).unwrap();
        value["status"] = serde_json::json!("limbo");
        let result: serde_json::Result<Manifest> = serde_json::from_value(value);
        assert!(result.is_err());
    }
}
