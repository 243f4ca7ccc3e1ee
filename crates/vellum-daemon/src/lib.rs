//! Daemon wiring for the vellum orchestrator.
//!
//! Builds the engine from configuration, connects the components, and runs
//! the long-lived loops: ingress watcher, intake, heartbeat. Shutdown is
//! cooperative: the watcher and heartbeat stop, the pool drains, and a
//! final cost report is emitted.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use vellum_core::config::EngineConfig;
use vellum_core::error::Result;

use vellum_fabric::breaker::BreakerConfig;
use vellum_fabric::cost::CostLedger;
use vellum_fabric::fabric::{FabricConfig, LlmFabric};
use vellum_fabric::pool::PoolConfig;
use vellum_fabric::provider::{GeminiProvider, LlmProvider, MockProvider};
use vellum_fabric::queue::QueueConfig;
use vellum_fabric::rate_limit::RateLimiterConfig;

use vellum_flow::hash_index::HashIndex;
use vellum_flow::ingress::{IngressConfig, IngressWatcher};
use vellum_flow::manifest_store::ManifestStore;
use vellum_flow::pipeline::{PipelineConfig, PipelineDriver};
use vellum_flow::state::{NoopAudio, StateMachine, StateMachineConfig};
use vellum_flow::trend::{StaticTrendSource, TrendConfig, TrendStore};

/// Hash index retention: entries older than this are dropped.
const HASH_MAX_AGE_DAYS: i64 = 30;
/// Hash index cap after the age pass.
const HASH_MAX_ENTRIES: usize = 10_000;

/// The assembled engine.
pub struct App {
    config: EngineConfig,
    state: Arc<StateMachine>,
    fabric: Arc<LlmFabric>,
    driver: Arc<PipelineDriver>,
    hash_index: Arc<HashIndex>,
}

impl App {
    /// Builds the engine from configuration. No I/O beyond reading
    /// persisted state files.
    ///
    /// # Errors
    ///
    /// Configuration and provider-construction failures.
    pub fn build(config: EngineConfig) -> Result<Self> {
        let provider: Arc<dyn LlmProvider> = if config.mock_mode {
            tracing::warn!("MOCK_MODE is set; using the scripted mock provider");
            Arc::new(MockProvider::new())
        } else {
            let api_key = config.api_key.clone().ok_or_else(|| {
                vellum_core::error::Error::configuration("GEMINI_API_KEY missing")
            })?;
            Arc::new(GeminiProvider::new(api_key, config.api_timeout)?)
        };

        let ledger = Arc::new(CostLedger::new(config.data_dir.join("cost_report.json")));
        let fabric = Arc::new(LlmFabric::new(
            FabricConfig {
                fallback_chain: config.fallback_chain.clone(),
                queue: QueueConfig {
                    max_in_flight: config.max_concurrency,
                    max_waiting: config.max_waiting,
                    drop_lowest: true,
                },
                rate_limiter: RateLimiterConfig::from_rpm(config.rate_limit_rpm),
                pool: PoolConfig {
                    min_sessions: 1,
                    max_sessions: config.max_concurrency.max(1),
                    idle_timeout: Duration::from_secs(300),
                    acquire_timeout: Duration::from_secs(30),
                },
                backoff_base: Duration::from_millis(500),
                attempt_deadline: config.api_timeout,
                breaker: BreakerConfig::default(),
            },
            provider,
            ledger,
        ));

        let store = ManifestStore::new(
            config.projects_dir.clone(),
            config.max_retries,
            config.model_names(),
        );
        let state = Arc::new(StateMachine::new(
            store,
            StateMachineConfig {
                max_retries: config.max_retries,
                max_stale_recoveries: config.max_stale_recoveries,
                stale_thresholds: config.stale_thresholds,
                dead_letter_dir: config.dead_letter_dir.clone(),
                alerts_path: config.logs_dir.join("alerts.log"),
                fallback_chain: config.fallback_chain.clone(),
            },
            Arc::new(NoopAudio),
        ));

        let trends = Arc::new(TrendStore::new(
            config.data_dir.join("trends_authority.json"),
            TrendConfig::default(),
            // The trend source is an external collaborator; the static
            // source stands in until one is wired.
            Arc::new(StaticTrendSource::new(Vec::new())),
        ));

        let hash_index = Arc::new(HashIndex::new(
            config.data_dir.join("processed_hashes.json"),
        ));

        let driver = Arc::new(PipelineDriver::new(
            Arc::clone(&state),
            Arc::clone(&fabric),
            trends,
            Arc::clone(&hash_index),
            PipelineConfig {
                max_retries: config.max_retries,
                audio_enabled: config.audio_enabled,
                audio_languages: config.audio_languages.clone(),
            },
        ));

        // Break the state-machine <-> driver cycle with the registered
        // recovery callback; re-entries run as independent tasks.
        {
            let driver = Arc::clone(&driver);
            state.set_recovery_callback(Arc::new(move |id| {
                let driver = Arc::clone(&driver);
                tokio::spawn(async move {
                    driver.run(id).await;
                });
            }));
        }

        Ok(Self {
            config,
            state,
            fabric,
            driver,
            hash_index,
        })
    }

    /// Runs the daemon until the shutdown signal flips.
    ///
    /// Startup order: hash index load, pool warm-up, heartbeat, watcher.
    /// The watcher is enabled only after warm-up completes.
    ///
    /// # Errors
    ///
    /// Fatal startup failures only; runtime task failures log and
    /// continue.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.hash_index.init().await;
        if let Err(e) = self.hash_index.cleanup(HASH_MAX_AGE_DAYS, HASH_MAX_ENTRIES).await {
            tracing::warn!(error = %e, "hash index cleanup failed");
        }

        self.fabric.warm_up().await?;
        tracing::info!("connection pool warm");

        let heartbeat = {
            let state = Arc::clone(&self.state);
            let interval = self.config.heartbeat_interval;
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The immediate first tick would sweep before anything ran.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => state.heartbeat_tick().await,
                        _ = shutdown.changed() => return,
                    }
                }
            })
        };

        let (doc_tx, mut doc_rx) = mpsc::channel(64);
        let watcher = IngressWatcher::new(
            IngressConfig {
                incoming_dir: self.config.incoming_dir.clone(),
                processed_dir: self.config.processed_dir(),
                stable_window: self.config.stable_write_window,
                poll_interval: Duration::from_millis(100),
            },
            doc_tx,
        );
        let watcher_handle = tokio::spawn(watcher.run(shutdown.clone()));
        tracing::info!(
            incoming = %self.config.incoming_dir.display(),
            "ingress watcher running"
        );

        loop {
            tokio::select! {
                document = doc_rx.recv() => {
                    let Some(document) = document else { break };
                    if let Some(id) = self.driver.ingest(document).await {
                        let driver = Arc::clone(&self.driver);
                        tokio::spawn(async move {
                            driver.run(id).await;
                        });
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("shutting down");
        let _ = watcher_handle.await;
        let _ = heartbeat.await;
        self.fabric.drain().await;

        let final_cost = self.fabric.ledger().snapshot();
        if let Err(e) = self.fabric.ledger().flush() {
            tracing::warn!(error = %e, "final cost report flush failed");
        }
        tracing::info!(
            total_tokens = final_cost.total_tokens,
            api_calls = final_cost.api_calls,
            estimated_cost_usd = final_cost.estimated_cost_usd,
            "final cost report"
        );
        Ok(())
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The state machine (tests and tooling).
    #[must_use]
    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::manifest::ProjectStatus;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            mock_mode: true,
            incoming_dir: dir.join("incoming"),
            projects_dir: dir.join("projects"),
            data_dir: dir.join("data"),
            dead_letter_dir: dir.join("dead-letter"),
            logs_dir: dir.join("logs"),
            stable_write_window: Duration::from_millis(30),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn build_wires_the_engine_in_mock_mode() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(test_config(dir.path())).unwrap();
        assert!(app.config().mock_mode);
    }

    #[test]
    fn build_without_key_outside_mock_mode_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            mock_mode: false,
            api_key: None,
            ..test_config(dir.path())
        };
        assert!(App::build(config).is_err());
    }

    #[tokio::test]
    async fn end_to_end_drop_file_to_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.incoming_dir).unwrap();
        let app = Arc::new(App::build(config).unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        // Give the watcher a beat, then drop a document.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(
            dir.path().join("incoming").join("note.md"),
            "an english document about schedulers and queues",
        )
        .unwrap();

        // Stable window + pipeline time with the mock provider. The mock
        // returns a script payload for every call, so the SEO stage fails
        // validation and the project parks in failed; what matters here
        // is the full wiring: watch, move, dedup, create, drive.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while tokio::time::Instant::now() < deadline {
            seen = app.state().store().list_ids().unwrap();
            if !seen.is_empty() {
                let manifest = app.state().store().load(seen[0]).unwrap();
                if manifest.status != ProjectStatus::Pending {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(seen.len(), 1, "exactly one project created");
        assert!(!dir.path().join("incoming").join("note.md").exists());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }
}
