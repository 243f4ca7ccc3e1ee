//! End-to-end pipeline tests over the mock provider.
//!
//! These drive the full intake → stages → hand-off path through real
//! manifests on disk, covering the happy path, duplicate inputs,
//! validation-driven degradation, chain exhaustion and stale recovery.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use vellum_core::config::{default_fallback_chain, StaleThresholds};
use vellum_core::content::Language;
use vellum_core::id::ProjectId;
use vellum_core::manifest::ProjectStatus;

use vellum_fabric::breaker::BreakerConfig;
use vellum_fabric::cost::CostLedger;
use vellum_fabric::fabric::{FabricConfig, LlmFabric};
use vellum_fabric::provider::{MockProvider, MockReply};

use vellum_flow::hash_index::HashIndex;
use vellum_flow::ingress::ReadyDocument;
use vellum_flow::manifest_store::ManifestStore;
use vellum_flow::pipeline::{PipelineConfig, PipelineDriver};
use vellum_flow::state::{NoopAudio, StateMachine, StateMachineConfig};
use vellum_flow::trend::{StaticTrendSource, TrendConfig, TrendStore};

struct Harness {
    dir: TempDir,
    provider: Arc<MockProvider>,
    state: Arc<StateMachine>,
    driver: Arc<PipelineDriver>,
}

impl Harness {
    fn new() -> Self {
        Self::with_audio(false)
    }

    fn with_audio(audio_enabled: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let chain = default_fallback_chain();
        let model_names: Vec<String> = chain.iter().map(|m| m.name.clone()).collect();

        let store = ManifestStore::new(dir.path().join("projects"), 3, model_names);
        let state = Arc::new(StateMachine::new(
            store,
            StateMachineConfig {
                max_retries: 3,
                max_stale_recoveries: 3,
                stale_thresholds: StaleThresholds::default(),
                dead_letter_dir: dir.path().join("dead-letter"),
                alerts_path: dir.path().join("logs").join("alerts.log"),
                fallback_chain: chain.clone(),
            },
            Arc::new(NoopAudio),
        ));

        let provider = Arc::new(MockProvider::new());
        let fabric = Arc::new(LlmFabric::new(
            FabricConfig {
                fallback_chain: chain,
                backoff_base: Duration::from_millis(1),
                breaker: BreakerConfig {
                    failure_threshold: 100,
                    ..BreakerConfig::default()
                },
                ..FabricConfig::default()
            },
            Arc::clone(&provider) as Arc<dyn vellum_fabric::provider::LlmProvider>,
            Arc::new(CostLedger::in_memory()),
        ));

        let trends = Arc::new(TrendStore::new(
            dir.path().join("data").join("trends_authority.json"),
            TrendConfig::default(),
            Arc::new(StaticTrendSource::new(vec![
                "rust".to_string(),
                "async".to_string(),
            ])),
        ));

        let hash_index = Arc::new(HashIndex::new(
            dir.path().join("data").join("processed_hashes.json"),
        ));

        let driver = Arc::new(PipelineDriver::new(
            Arc::clone(&state),
            fabric,
            trends,
            hash_index,
            PipelineConfig {
                max_retries: 1,
                audio_enabled,
                audio_languages: vec!["en".to_string(), "zh".to_string()],
            },
        ));

        Self {
            dir,
            provider,
            state,
            driver,
        }
    }

    fn write_document(&self, name: &str, content: &str) -> ReadyDocument {
        let processed = self.dir.path().join("incoming").join("processed");
        std::fs::create_dir_all(&processed).unwrap();
        let path = processed.join(name);
        std::fs::write(&path, content).unwrap();
        let words = content.split_whitespace().count();
        ReadyDocument {
            path,
            content: content.to_string(),
            language: Language::En,
            word_count: words,
            reading_time_seconds: (words as u64 * 60).div_ceil(200),
        }
    }

    fn enqueue_happy_replies(&self, model: &str) {
        self.provider
            .enqueue(model, MockReply::Text(good_script_json()));
        self.provider.enqueue(model, MockReply::Text(good_seo_json()));
        self.provider
            .enqueue(model, MockReply::Text(good_shorts_json()));
    }
}

fn good_script_json() -> String {
    serde_json::json!({
        "title": "How Async Executors Schedule Work",
        "segments": [
            {
                "timestamp": "00:00",
                "voiceover": "Futures do nothing until polled.",
                "visual_hint": "talking_head",
                "estimated_duration_seconds": 8.0
            },
            {
                "timestamp": "00:40",
                "voiceover": "The executor owns the run queue.",
                "visual_hint": "animation",
                "estimated_duration_seconds": 12.5
            }
        ]
    })
    .to_string()
}

fn bad_enum_script_json() -> String {
    serde_json::json!({
        "title": "How Async Executors Schedule Work",
        "segments": [{
            "timestamp": "00:00",
            "voiceover": "Futures do nothing until polled.",
            "visual_hint": "b_roll",
            "estimated_duration_seconds": 8.0
        }]
    })
    .to_string()
}

fn good_seo_json() -> String {
    serde_json::json!({
        "regions": {
            "us": {
                "title": "Async Executors Explained",
                "description": "How run queues and wakers fit together.",
                "tags": ["rust", "async"],
                "keywords": ["async executor", "rust"]
            },
            "tw": {
                "title": "非同步執行器解析",
                "description": "工作佇列與喚醒器如何協作。",
                "tags": ["rust"],
                "keywords": ["非同步"]
            }
        }
    })
    .to_string()
}

fn good_shorts_json() -> String {
    serde_json::json!({
        "hooks": [
            {
                "timestamp": "00:00",
                "hook_text": "Your future does nothing until something polls it.",
                "emotional_trigger": "curiosity",
                "call_to_action": "Watch how executors really work."
            },
            {
                "timestamp": "00:40",
                "hook_text": "The run queue is the whole secret.",
                "emotional_trigger": "surprise",
                "call_to_action": "See the scheduler from the inside."
            }
        ]
    })
    .to_string()
}

fn english_words(n: usize) -> String {
    (0..n)
        .map(|i| format!("word{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test]
async fn happy_path_produces_a_rendering_manifest() {
    let h = Harness::new();
    h.enqueue_happy_replies("gemini-2.5-pro");

    let document = h.write_document("x.md", &english_words(250));
    let id = h.driver.ingest(document).await.expect("project created");
    h.driver.run(id).await;

    let manifest = h.state.store().load(id).unwrap();
    assert_eq!(manifest.status, ProjectStatus::Rendering);
    assert!(manifest.meta.cost.api_calls >= 3);
    let script = manifest.content_engine.script.expect("script present");
    assert!(!script.segments.is_empty());
    assert_eq!(manifest.content_engine.seo.unwrap().regions.len(), 2);
    assert!(!manifest.content_engine.shorts.is_empty());
    assert!(manifest.content_engine.voice_profile.is_some());
    assert!(manifest.meta.used_models.is_empty());
    assert!(!manifest.meta.is_fallback_mode);
}

#[tokio::test]
async fn duplicate_document_is_skipped() {
    let h = Harness::new();
    h.enqueue_happy_replies("gemini-2.5-pro");

    let body = english_words(120);
    let first = h.write_document("x.md", &body);
    let id = h.driver.ingest(first).await.expect("first accepted");
    h.driver.run(id).await;

    // Byte-identical copy under a different name.
    let copy = h.write_document("x_copy.md", &body);
    let copy_path = copy.path.clone();
    assert!(h.driver.ingest(copy).await.is_none());

    // The duplicate file stays in the processed subtree; only one
    // manifest exists.
    assert!(copy_path.exists());
    assert_eq!(h.state.store().list_ids().unwrap(), vec![id]);
}

#[tokio::test]
async fn enum_mismatch_degrades_then_succeeds_on_fallback() {
    let h = Harness::new();
    // First model returns an invalid visual_hint enum.
    h.provider
        .enqueue("gemini-2.5-pro", MockReply::Text(bad_enum_script_json()));
    // The fallback model behaves.
    h.enqueue_happy_replies("gemini-2.5-flash");

    let (tx, rx) = std::sync::mpsc::channel::<ProjectId>();
    h.state.set_recovery_callback(Arc::new(move |id| {
        let _ = tx.send(id);
    }));

    let document = h.write_document("doc.md", &english_words(80));
    let id = h.driver.ingest(document).await.unwrap();
    h.driver.run(id).await;

    // The failure degraded the project onto the next model.
    let manifest = h.state.store().load(id).unwrap();
    assert_eq!(manifest.meta.used_models, vec!["gemini-2.5-pro"]);
    assert_eq!(manifest.meta.current_model, "gemini-2.5-flash");
    assert!(manifest.meta.is_fallback_mode);
    assert_eq!(manifest.status, ProjectStatus::Analyzing);
    let fingerprint = manifest.meta.error_fingerprint.unwrap();
    assert_eq!(fingerprint.code, "invalid_enum_value");

    // Re-enter the pipeline the way the daemon's recovery callback does.
    let recovered = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(recovered, id);
    h.driver.run(id).await;

    let manifest = h.state.store().load(id).unwrap();
    assert_eq!(manifest.status, ProjectStatus::Rendering);
    assert!(manifest.meta.is_fallback_mode);
    assert!(manifest.content_engine.script.is_some());

    // The fallback prompt carried the degradation directive.
    let flash_calls: Vec<_> = h
        .provider
        .calls()
        .into_iter()
        .filter(|(model, _)| model == "gemini-2.5-flash")
        .collect();
    assert!(flash_calls[0].1.contains("closed value sets"));
}

#[tokio::test]
async fn exhausting_every_model_dead_letters_with_alert() {
    let h = Harness::new();
    for model in ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash-lite"] {
        h.provider
            .enqueue(model, MockReply::Text(bad_enum_script_json()));
    }

    let (tx, rx) = std::sync::mpsc::channel::<ProjectId>();
    h.state.set_recovery_callback(Arc::new(move |id| {
        let _ = tx.send(id);
    }));

    let document = h.write_document("doomed.md", &english_words(60));
    let id = h.driver.ingest(document).await.unwrap();

    // First run plus one re-entry per degradation until the chain runs dry.
    h.driver.run(id).await;
    while let Ok(recovered) = rx.recv_timeout(Duration::from_millis(200)) {
        h.driver.run(recovered).await;
    }

    let manifest = h.state.store().load(id).unwrap();
    assert_eq!(manifest.status, ProjectStatus::DeadLetter);
    assert!(manifest.meta.is_dead_letter);
    assert_eq!(
        manifest.meta.used_models,
        vec!["gemini-2.5-pro", "gemini-2.5-flash"]
    );

    let snapshots: Vec<_> = std::fs::read_dir(h.dir.path().join("dead-letter"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0]
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with(&id.to_string()));

    let alerts =
        std::fs::read_to_string(h.dir.path().join("logs").join("alerts.log")).unwrap();
    let line = alerts.lines().next().unwrap();
    assert!(line.contains("\"severity\":\"critical\""));
    assert!(line.contains(&id.to_string()));
}

#[tokio::test]
async fn stale_analyzing_project_reenters_via_heartbeat() {
    let h = Harness::new();
    h.enqueue_happy_replies("gemini-2.5-pro");

    let (tx, rx) = std::sync::mpsc::channel::<ProjectId>();
    h.state.set_recovery_callback(Arc::new(move |id| {
        let _ = tx.send(id);
    }));

    let document = h.write_document("stalled.md", &english_words(90));
    let id = h.driver.ingest(document).await.unwrap();

    // Simulate a driver killed mid-analyzing: status set, no progress.
    h.state.transition(id, ProjectStatus::Analyzing).unwrap();
    let mut manifest = h.state.store().load(id).unwrap();
    manifest.updated_at = chrono::Utc::now() - chrono::Duration::minutes(11);
    h.state.store().save(&manifest).unwrap();

    h.state.heartbeat_tick().await;

    let manifest = h.state.store().load(id).unwrap();
    assert_eq!(manifest.status, ProjectStatus::Pending);
    assert_eq!(manifest.meta.stale_recovery_count, 1);

    // The recovery callback re-enters the pipeline and completes it.
    let recovered = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    h.driver.run(recovered).await;
    assert_eq!(
        h.state.store().load(id).unwrap().status,
        ProjectStatus::Rendering
    );
}

#[tokio::test]
async fn audio_mode_parks_in_pending_audio_with_narration_siblings() {
    let h = Harness::with_audio(true);
    h.enqueue_happy_replies("gemini-2.5-pro");

    let document = h.write_document("narrated.md", &english_words(70));
    let id = h.driver.ingest(document).await.unwrap();
    h.driver.run(id).await;

    let manifest = h.state.store().load(id).unwrap();
    assert_eq!(manifest.status, ProjectStatus::PendingAudio);
    let audio = manifest.content_engine.audio.unwrap();
    assert_eq!(audio.slots.len(), 2);
    assert!(!audio.all_ready());

    let project_dir = h.state.store().project_dir(id);
    assert!(project_dir.join("notebooklm_script_en.md").exists());
    assert!(project_dir.join("notebooklm_script_zh.md").exists());
}

#[tokio::test]
async fn provider_rate_limit_errors_do_not_degrade() {
    let h = Harness::new();
    // Every attempt on the head model is a 429; driver max_retries is 1,
    // so the fabric falls through the chain. All models 429.
    for model in ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash-lite"] {
        h.provider.enqueue(
            model,
            MockReply::Failure {
                status: Some(429),
                reason: "RESOURCE_EXHAUSTED".into(),
            },
        );
    }

    let document = h.write_document("limited.md", &english_words(50));
    let id = h.driver.ingest(document).await.unwrap();
    h.driver.run(id).await;

    let manifest = h.state.store().load(id).unwrap();
    // The 429 shows through the all-models-failed wrapper, so the project
    // retries at the same model instead of degrading.
    assert_eq!(manifest.status, ProjectStatus::Failed);
    assert_eq!(manifest.meta.retry_count, 1);
    assert!(manifest.meta.used_models.is_empty());
    let fingerprint = manifest.meta.error_fingerprint.unwrap();
    assert!(fingerprint.code.contains("429"));
}

#[test]
fn project_dir_layout_uses_the_uuid() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::new(dir.path().join("projects"), 3, Vec::new());
    let id = ProjectId::generate();
    assert_eq!(
        store.project_dir(id),
        dir.path().join("projects").join(id.to_string())
    );
}
