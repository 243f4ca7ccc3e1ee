//! Engine configuration.
//!
//! All configuration is environment-driven; the daemon takes no positional
//! arguments. `from_env_with` accepts a key lookup function so tests can
//! inject environments without touching the process.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manifest::ProjectStatus;

const ENV_API_KEY: &str = "GEMINI_API_KEY";
const ENV_MOCK_MODE: &str = "MOCK_MODE";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
const ENV_INCOMING_DIR: &str = "VELLUM_INCOMING_DIR";
const ENV_PROJECTS_DIR: &str = "VELLUM_PROJECTS_DIR";
const ENV_DATA_DIR: &str = "VELLUM_DATA_DIR";
const ENV_DEAD_LETTER_DIR: &str = "VELLUM_DEAD_LETTER_DIR";
const ENV_LOGS_DIR: &str = "VELLUM_LOGS_DIR";
const ENV_RATE_LIMIT_RPM: &str = "VELLUM_RATE_LIMIT_RPM";
const ENV_MAX_CONCURRENCY: &str = "VELLUM_MAX_CONCURRENCY";
const ENV_MAX_WAITING: &str = "VELLUM_MAX_WAITING";
const ENV_API_TIMEOUT_SECS: &str = "VELLUM_API_TIMEOUT_SECS";
const ENV_HEARTBEAT_INTERVAL_SECS: &str = "VELLUM_HEARTBEAT_INTERVAL_SECS";
const ENV_MAX_RETRIES: &str = "VELLUM_MAX_RETRIES";
const ENV_MAX_STALE_RECOVERIES: &str = "VELLUM_MAX_STALE_RECOVERIES";
const ENV_STABLE_WRITE_MS: &str = "VELLUM_STABLE_WRITE_MS";
const ENV_AUDIO_ENABLED: &str = "VELLUM_AUDIO_ENABLED";
const ENV_STALE_ANALYZING_SECS: &str = "VELLUM_STALE_ANALYZING_SECS";
const ENV_STALE_RENDERING_SECS: &str = "VELLUM_STALE_RENDERING_SECS";
const ENV_STALE_UPLOADING_SECS: &str = "VELLUM_STALE_UPLOADING_SECS";
const ENV_STALE_DEGRADED_RETRY_SECS: &str = "VELLUM_STALE_DEGRADED_RETRY_SECS";

const DEFAULT_RATE_LIMIT_RPM: u64 = 60;
const DEFAULT_MAX_CONCURRENCY: u64 = 4;
const DEFAULT_MAX_WAITING: u64 = 32;
const DEFAULT_API_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u64 = 3;
const DEFAULT_MAX_STALE_RECOVERIES: u64 = 3;
const DEFAULT_STABLE_WRITE_MS: u64 = 2000;

/// One model in the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Provider model name.
    pub name: String,
    /// Strict models always receive the expanded degradation prompt with
    /// enumerated schemas and limits.
    pub strict: bool,
}

impl ModelSpec {
    /// Creates a model spec.
    #[must_use]
    pub fn new(name: impl Into<String>, strict: bool) -> Self {
        Self {
            name: name.into(),
            strict,
        }
    }
}

/// Per-status staleness thresholds for the heartbeat sweep.
///
/// Statuses without a threshold are not monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleThresholds {
    /// Threshold for `analyzing`.
    pub analyzing: Duration,
    /// Threshold for `rendering`.
    pub rendering: Duration,
    /// Threshold for `uploading`.
    pub uploading: Duration,
    /// Threshold for `degraded_retry`.
    pub degraded_retry: Duration,
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self {
            analyzing: Duration::from_secs(600),
            rendering: Duration::from_secs(1800),
            uploading: Duration::from_secs(300),
            degraded_retry: Duration::from_secs(900),
        }
    }
}

impl StaleThresholds {
    /// Returns the threshold for a status, or `None` when the status is not
    /// monitored for staleness.
    #[must_use]
    pub fn for_status(&self, status: ProjectStatus) -> Option<Duration> {
        match status {
            ProjectStatus::Analyzing => Some(self.analyzing),
            ProjectStatus::Rendering => Some(self.rendering),
            ProjectStatus::Uploading => Some(self.uploading),
            ProjectStatus::DegradedRetry => Some(self.degraded_retry),
            _ => None,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider API key; absent in mock mode.
    pub api_key: Option<String>,
    /// When true, the provider is replaced by the scripted mock.
    pub mock_mode: bool,
    /// Log filter directive (`info`, `vellum_flow=debug`, ...).
    pub log_level: String,
    /// Directory watched for incoming documents.
    pub incoming_dir: PathBuf,
    /// Directory manifests are persisted under.
    pub projects_dir: PathBuf,
    /// Directory for singleton state files (trends, hashes, cost report).
    pub data_dir: PathBuf,
    /// Directory dead-letter snapshots are written to.
    pub dead_letter_dir: PathBuf,
    /// Directory the alert log lives in.
    pub logs_dir: PathBuf,
    /// Provider request ceiling, requests per minute.
    pub rate_limit_rpm: u64,
    /// Maximum in-flight provider calls.
    pub max_concurrency: usize,
    /// Maximum waiters in the priority queue.
    pub max_waiting: usize,
    /// Provider call deadline.
    pub api_timeout: Duration,
    /// Heartbeat tick interval.
    pub heartbeat_interval: Duration,
    /// Retry cap before dead-letter.
    pub max_retries: u32,
    /// Stale recovery cap before the project is failed.
    pub max_stale_recoveries: u32,
    /// Size-stability window for the ingress watcher.
    pub stable_write_window: Duration,
    /// Whether the audio collaborator is enabled.
    pub audio_enabled: bool,
    /// Language slots the audio collaborator must fill.
    pub audio_languages: Vec<String>,
    /// Per-status staleness thresholds.
    pub stale_thresholds: StaleThresholds,
    /// Ordered model fallback chain; position 0 is preferred.
    pub fallback_chain: Vec<ModelSpec>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("mock_mode", &self.mock_mode)
            .field("log_level", &self.log_level)
            .field("incoming_dir", &self.incoming_dir)
            .field("projects_dir", &self.projects_dir)
            .field("data_dir", &self.data_dir)
            .field("dead_letter_dir", &self.dead_letter_dir)
            .field("logs_dir", &self.logs_dir)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_waiting", &self.max_waiting)
            .field("api_timeout", &self.api_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_retries", &self.max_retries)
            .field("max_stale_recoveries", &self.max_stale_recoveries)
            .field("stable_write_window", &self.stable_write_window)
            .field("audio_enabled", &self.audio_enabled)
            .field("fallback_chain", &self.fallback_chain)
            .finish_non_exhaustive()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            mock_mode: false,
            log_level: "info".to_string(),
            incoming_dir: PathBuf::from("incoming"),
            projects_dir: PathBuf::from("projects"),
            data_dir: PathBuf::from("data"),
            dead_letter_dir: PathBuf::from("dead-letter"),
            logs_dir: PathBuf::from("logs"),
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
            max_concurrency: DEFAULT_MAX_CONCURRENCY as usize,
            max_waiting: DEFAULT_MAX_WAITING as usize,
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            max_retries: DEFAULT_MAX_RETRIES as u32,
            max_stale_recoveries: DEFAULT_MAX_STALE_RECOVERIES as u32,
            stable_write_window: Duration::from_millis(DEFAULT_STABLE_WRITE_MS),
            audio_enabled: false,
            audio_languages: vec!["en".to_string(), "zh".to_string()],
            stale_thresholds: StaleThresholds::default(),
            fallback_chain: default_fallback_chain(),
        }
    }
}

/// The default Gemini fallback chain. The tail model is strict: it needs
/// the fully enumerated schema block to return parseable output.
#[must_use]
pub fn default_fallback_chain() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("gemini-2.5-pro", false),
        ModelSpec::new("gemini-2.5-flash", false),
        ModelSpec::new("gemini-2.0-flash-lite", true),
    ]
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a numeric value fails strict
    /// validation, or when no API key is present outside mock mode.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// Test-friendly entry point accepting a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a numeric value is not a positive
    /// integer, or when no API key is present outside mock mode.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mock_mode = get_env(ENV_MOCK_MODE)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let api_key = get_env(ENV_API_KEY).filter(|k| !k.trim().is_empty());

        if !mock_mode && api_key.is_none() {
            return Err(Error::configuration(format!(
                "{ENV_API_KEY} is required when {ENV_MOCK_MODE} is not set"
            )));
        }

        let dir = |key: &str, default: &PathBuf| {
            get_env(key).map_or_else(|| default.clone(), PathBuf::from)
        };

        let stale = StaleThresholds {
            analyzing: Duration::from_secs(parse_positive(
                &get_env,
                ENV_STALE_ANALYZING_SECS,
                defaults.stale_thresholds.analyzing.as_secs(),
            )?),
            rendering: Duration::from_secs(parse_positive(
                &get_env,
                ENV_STALE_RENDERING_SECS,
                defaults.stale_thresholds.rendering.as_secs(),
            )?),
            uploading: Duration::from_secs(parse_positive(
                &get_env,
                ENV_STALE_UPLOADING_SECS,
                defaults.stale_thresholds.uploading.as_secs(),
            )?),
            degraded_retry: Duration::from_secs(parse_positive(
                &get_env,
                ENV_STALE_DEGRADED_RETRY_SECS,
                defaults.stale_thresholds.degraded_retry.as_secs(),
            )?),
        };

        Ok(Self {
            api_key,
            mock_mode,
            log_level: get_env(ENV_LOG_LEVEL).unwrap_or_else(|| defaults.log_level.clone()),
            incoming_dir: dir(ENV_INCOMING_DIR, &defaults.incoming_dir),
            projects_dir: dir(ENV_PROJECTS_DIR, &defaults.projects_dir),
            data_dir: dir(ENV_DATA_DIR, &defaults.data_dir),
            dead_letter_dir: dir(ENV_DEAD_LETTER_DIR, &defaults.dead_letter_dir),
            logs_dir: dir(ENV_LOGS_DIR, &defaults.logs_dir),
            rate_limit_rpm: parse_positive(&get_env, ENV_RATE_LIMIT_RPM, DEFAULT_RATE_LIMIT_RPM)?,
            max_concurrency: usize::try_from(parse_positive(
                &get_env,
                ENV_MAX_CONCURRENCY,
                DEFAULT_MAX_CONCURRENCY,
            )?)
            .map_err(|_| Error::configuration("max concurrency exceeds supported range"))?,
            max_waiting: usize::try_from(parse_positive(
                &get_env,
                ENV_MAX_WAITING,
                DEFAULT_MAX_WAITING,
            )?)
            .map_err(|_| Error::configuration("max waiting exceeds supported range"))?,
            api_timeout: Duration::from_secs(parse_positive(
                &get_env,
                ENV_API_TIMEOUT_SECS,
                DEFAULT_API_TIMEOUT_SECS,
            )?),
            heartbeat_interval: Duration::from_secs(parse_positive(
                &get_env,
                ENV_HEARTBEAT_INTERVAL_SECS,
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?),
            max_retries: u32::try_from(parse_positive(
                &get_env,
                ENV_MAX_RETRIES,
                DEFAULT_MAX_RETRIES,
            )?)
            .map_err(|_| Error::configuration("max retries exceeds supported range"))?,
            max_stale_recoveries: u32::try_from(parse_positive(
                &get_env,
                ENV_MAX_STALE_RECOVERIES,
                DEFAULT_MAX_STALE_RECOVERIES,
            )?)
            .map_err(|_| Error::configuration("max stale recoveries exceeds supported range"))?,
            stable_write_window: Duration::from_millis(parse_positive(
                &get_env,
                ENV_STABLE_WRITE_MS,
                DEFAULT_STABLE_WRITE_MS,
            )?),
            audio_enabled: get_env(ENV_AUDIO_ENABLED)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
            audio_languages: defaults.audio_languages,
            stale_thresholds: stale,
            fallback_chain: defaults.fallback_chain,
        })
    }

    /// The processed subtree under the incoming directory.
    #[must_use]
    pub fn processed_dir(&self) -> PathBuf {
        self.incoming_dir.join("processed")
    }

    /// Model names of the fallback chain, in order.
    #[must_use]
    pub fn model_names(&self) -> Vec<String> {
        self.fallback_chain.iter().map(|m| m.name.clone()).collect()
    }

    /// Looks up a model spec by name.
    #[must_use]
    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.fallback_chain.iter().find(|m| m.name == name)
    }
}

fn parse_positive<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}
