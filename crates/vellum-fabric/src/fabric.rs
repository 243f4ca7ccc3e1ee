//! The call fabric: admission, fallback, degradation and accounting.
//!
//! Every generation request serialises through the priority queue, the
//! rate limiter and the connection pool, then walks the model fallback
//! chain. Each model attempt is gated by that model's circuit breaker and
//! retried with decorrelated exponential backoff. Successful attempts are
//! recorded to the cost ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;

use vellum_core::config::ModelSpec;
use vellum_core::content::{MAX_SHORT_HOOKS, MAX_TITLE_CHARS, MAX_VOICEOVER_CHARS, VisualHint};
use vellum_core::error::{Error, Result};
use vellum_core::id::{ProjectId, TraceId};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::cost::CostLedger;
use crate::pool::{ConnectionPool, PoolConfig, SessionFactory};
use crate::provider::LlmProvider;
use crate::queue::{Priority, PriorityQueue, QueueConfig};
use crate::rate_limit::{RateLimiter, RateLimiterConfig};

/// Counter: total generation requests by priority.
pub const GENERATE_REQUESTS_TOTAL: &str = "vellum_fabric_generate_requests_total";
/// Counter: provider attempts by model and outcome.
pub const PROVIDER_ATTEMPTS_TOTAL: &str = "vellum_fabric_provider_attempts_total";
/// Counter: fallback-chain advances.
pub const MODEL_FALLBACKS_TOTAL: &str = "vellum_fabric_model_fallbacks_total";

/// Fabric configuration.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Ordered model fallback chain; position 0 is preferred.
    pub fallback_chain: Vec<ModelSpec>,
    /// Queue limits.
    pub queue: QueueConfig,
    /// Rate limiter parameters.
    pub rate_limiter: RateLimiterConfig,
    /// Pool limits.
    pub pool: PoolConfig,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Per-attempt provider deadline.
    pub attempt_deadline: Duration,
    /// Breaker parameters, shared by every per-model breaker.
    pub breaker: BreakerConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            fallback_chain: vellum_core::config::default_fallback_chain(),
            queue: QueueConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            pool: PoolConfig::default(),
            backoff_base: Duration::from_millis(500),
            attempt_deadline: Duration::from_secs(120),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Options for one generation request.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Project the request belongs to.
    pub project_id: ProjectId,
    /// Correlation id for logs.
    pub trace_id: TraceId,
    /// Admission priority.
    pub priority: Priority,
    /// Retry attempts per model.
    pub max_retries: u32,
    /// Start the chain at this model instead of the head.
    pub preferred_model: Option<String>,
}

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    /// Generated text with any fenced-code wrapper stripped.
    pub text: String,
    /// The model that produced the text.
    pub model_used: String,
    /// True when the model is not the chain head.
    pub is_fallback_mode: bool,
    /// Tokens charged for the call.
    pub tokens_used: u64,
}

/// Pool factory over a shared provider handle.
pub struct ProviderSessionFactory {
    provider: Arc<dyn LlmProvider>,
}

/// A logical session to the provider.
pub struct ProviderSession {
    provider: Arc<dyn LlmProvider>,
}

#[async_trait::async_trait]
impl SessionFactory for ProviderSessionFactory {
    type Session = ProviderSession;

    async fn create(&self) -> Result<ProviderSession> {
        Ok(ProviderSession {
            provider: Arc::clone(&self.provider),
        })
    }

    async fn destroy(&self, session: ProviderSession) {
        drop(session);
    }

    async fn validate(&self, _session: &ProviderSession) -> bool {
        true
    }
}

/// The LLM call fabric.
pub struct LlmFabric {
    config: FabricConfig,
    queue: PriorityQueue,
    limiter: RateLimiter,
    pool: ConnectionPool<ProviderSessionFactory>,
    ledger: Arc<CostLedger>,
    breakers: HashMap<String, CircuitBreaker>,
}

impl LlmFabric {
    /// Wires the fabric over a provider and ledger.
    #[must_use]
    pub fn new(config: FabricConfig, provider: Arc<dyn LlmProvider>, ledger: Arc<CostLedger>) -> Self {
        let breakers = config
            .fallback_chain
            .iter()
            .map(|m| (m.name.clone(), CircuitBreaker::new(config.breaker)))
            .collect();
        Self {
            queue: PriorityQueue::new(config.queue),
            limiter: RateLimiter::new(config.rate_limiter),
            pool: ConnectionPool::new(
                ProviderSessionFactory { provider },
                config.pool,
            ),
            ledger,
            breakers,
            config,
        }
    }

    /// Pre-opens the minimum pool sessions; gates daemon startup.
    ///
    /// # Errors
    ///
    /// Returns the first session-creation failure.
    pub async fn warm_up(&self) -> Result<()> {
        self.pool.warm_up().await
    }

    /// Refuses new work and closes idle sessions.
    pub async fn drain(&self) {
        self.pool.drain().await;
    }

    /// The fabric's cost ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    /// The configured fallback chain.
    #[must_use]
    pub fn fallback_chain(&self) -> &[ModelSpec] {
        &self.config.fallback_chain
    }

    /// Runs one generation request through the fabric.
    ///
    /// # Errors
    ///
    /// Queue, pool and provider failures bubble out typed; exhausting the
    /// whole chain yields [`Error::AllModelsFailed`].
    pub async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<GenerateOutcome> {
        counter!(GENERATE_REQUESTS_TOTAL, "priority" => format!("{:?}", opts.priority))
            .increment(1);

        let _permit = self.queue.acquire(opts.priority).await?;
        self.limiter.acquire().await;
        let session = self.pool.acquire().await?;

        let start_index = opts
            .preferred_model
            .as_deref()
            .and_then(|preferred| {
                self.config
                    .fallback_chain
                    .iter()
                    .position(|m| m.name == preferred)
            })
            .unwrap_or(0);

        let max_attempts = opts.max_retries.max(1);
        let mut last_error: Option<Error> = None;
        let mut models_tried = 0usize;

        for (index, model) in self
            .config
            .fallback_chain
            .iter()
            .enumerate()
            .skip(start_index)
        {
            let is_fallback_mode = index > 0;
            if models_tried > 0 {
                counter!(MODEL_FALLBACKS_TOTAL, "model" => model.name.clone()).increment(1);
            }
            models_tried += 1;

            let effective_prompt = if is_fallback_mode || model.strict {
                format!("{}\n\n{prompt}", degradation_prefix(model.strict))
            } else {
                prompt.to_string()
            };

            for attempt in 1..=max_attempts {
                let attempt_result = self
                    .attempt(&session, &model.name, &effective_prompt)
                    .await;

                match attempt_result {
                    Ok(response) => {
                        let tokens_used = response
                            .usage
                            .map_or_else(
                                || estimate_tokens(&effective_prompt, &response.text),
                                |u| u.total(),
                            );
                        self.ledger.record(&model.name, tokens_used);
                        counter!(PROVIDER_ATTEMPTS_TOTAL,
                            "model" => model.name.clone(), "outcome" => "success")
                        .increment(1);
                        tracing::debug!(
                            project_id = %opts.project_id,
                            trace_id = %opts.trace_id,
                            model = %model.name,
                            attempt,
                            tokens = tokens_used,
                            fallback = is_fallback_mode,
                            "generation succeeded"
                        );
                        return Ok(GenerateOutcome {
                            text: strip_code_fences(&response.text),
                            model_used: model.name.clone(),
                            is_fallback_mode,
                            tokens_used,
                        });
                    }
                    Err(err) => {
                        counter!(PROVIDER_ATTEMPTS_TOTAL,
                            "model" => model.name.clone(), "outcome" => "failure")
                        .increment(1);
                        tracing::warn!(
                            project_id = %opts.project_id,
                            trace_id = %opts.trace_id,
                            model = %model.name,
                            attempt,
                            error = %err,
                            "generation attempt failed"
                        );
                        last_error = Some(err);
                        if attempt < max_attempts {
                            tokio::time::sleep(backoff_delay(self.config.backoff_base, attempt))
                                .await;
                        }
                    }
                }
            }
        }

        Err(Error::AllModelsFailed {
            models_tried,
            last_error: last_error
                .map_or_else(|| "no models configured".to_string(), |e| e.to_string()),
        })
    }

    async fn attempt(
        &self,
        session: &crate::pool::PooledSession<ProviderSessionFactory>,
        model: &str,
        prompt: &str,
    ) -> Result<crate::provider::ProviderResponse> {
        let breaker = self.breakers.get(model);
        if let Some(breaker) = breaker {
            breaker.check()?;
        }

        let result = tokio::time::timeout(
            self.config.attempt_deadline,
            session.session().provider.generate(prompt, model),
        )
        .await
        .unwrap_or(Err(Error::Deadline {
            seconds: self.config.attempt_deadline.as_secs(),
        }));

        if let Some(breaker) = breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }
        result
    }
}

/// Exponential backoff with decorrelated jitter:
/// `base * 2^(n-1) * uniform[0.5, 1.0)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * f64::from(1u32 << (attempt - 1).min(16));
    let factor = rand::thread_rng().gen_range(0.5..1.0);
    Duration::from_secs_f64(exp * factor)
}

/// Token estimate when the provider reports no usage:
/// `ceil((|prompt| + |response|) / 4)`.
fn estimate_tokens(prompt: &str, response: &str) -> u64 {
    ((prompt.len() + response.len()) as u64).div_ceil(4)
}

/// Strips a single optional ```` ```json ```` / ```` ``` ```` wrapper.
#[must_use]
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

/// The prompt prefix prepended in fallback mode.
///
/// Strict models additionally get the enumerated schema limits the
/// downstream validators enforce.
#[must_use]
pub fn degradation_prefix(strict: bool) -> String {
    let mut prefix = String::from(
        "Respond in plain language. Return exactly the JSON schema requested: \
         every field present, field lengths bounded, enum fields restricted to \
         their closed value sets, and no null values anywhere.",
    );
    if strict {
        prefix.push_str(&format!(
            " Allowed visual_hint values: {}. Title at most {MAX_TITLE_CHARS} \
             characters. Voiceover at most {MAX_VOICEOVER_CHARS} characters per \
             segment. At most {MAX_SHORT_HOOKS} hooks. Timestamps formatted HH:MM.",
            VisualHint::NAMES.join(", ")
        ));
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, MockReply};

    fn fabric_with(provider: Arc<MockProvider>) -> LlmFabric {
        let config = FabricConfig {
            backoff_base: Duration::from_millis(1),
            attempt_deadline: Duration::from_secs(5),
            ..FabricConfig::default()
        };
        LlmFabric::new(config, provider, Arc::new(CostLedger::in_memory()))
    }

    fn options(max_retries: u32) -> GenerateOptions {
        GenerateOptions {
            project_id: ProjectId::generate(),
            trace_id: TraceId::generate(),
            priority: Priority::High,
            max_retries,
            preferred_model: None,
        }
    }

    #[tokio::test]
    async fn happy_path_uses_chain_head() {
        let provider = Arc::new(MockProvider::new());
        provider.enqueue("gemini-2.5-pro", MockReply::Text("{\"ok\":true}".into()));
        let fabric = fabric_with(Arc::clone(&provider));

        let outcome = fabric.generate("prompt", &options(3)).await.unwrap();
        assert_eq!(outcome.model_used, "gemini-2.5-pro");
        assert!(!outcome.is_fallback_mode);
        assert_eq!(outcome.text, "{\"ok\":true}");
        assert_eq!(fabric.ledger().snapshot().api_calls, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_advance_the_chain() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..2 {
            provider.enqueue(
                "gemini-2.5-pro",
                MockReply::Failure {
                    status: Some(500),
                    reason: "INTERNAL".into(),
                },
            );
        }
        provider.enqueue("gemini-2.5-flash", MockReply::Text("fallback text".into()));
        let fabric = fabric_with(Arc::clone(&provider));

        let outcome = fabric.generate("prompt", &options(2)).await.unwrap();
        assert_eq!(outcome.model_used, "gemini-2.5-flash");
        assert!(outcome.is_fallback_mode);
        assert_eq!(provider.calls_for("gemini-2.5-pro"), 2);
    }

    #[tokio::test]
    async fn fallback_prompts_carry_the_degradation_prefix() {
        let provider = Arc::new(MockProvider::new());
        provider.enqueue(
            "gemini-2.5-pro",
            MockReply::Failure {
                status: Some(500),
                reason: "INTERNAL".into(),
            },
        );
        provider.enqueue("gemini-2.5-flash", MockReply::Text("ok".into()));
        let fabric = fabric_with(Arc::clone(&provider));

        fabric.generate("the task", &options(1)).await.unwrap();
        let calls = provider.calls();
        let (_, head_prompt) = &calls[0];
        let (_, fallback_prompt) = &calls[1];
        assert!(!head_prompt.contains("closed value sets"));
        assert!(fallback_prompt.contains("closed value sets"));
    }

    #[tokio::test]
    async fn strict_model_prompt_enumerates_limits() {
        let provider = Arc::new(MockProvider::new());
        let fabric = fabric_with(Arc::clone(&provider));
        let opts = GenerateOptions {
            preferred_model: Some("gemini-2.0-flash-lite".into()),
            ..options(1)
        };
        fabric.generate("the task", &opts).await.unwrap();
        let calls = provider.calls();
        assert!(calls[0].1.contains("talking_head"));
        assert!(calls[0].1.contains("HH:MM"));
    }

    #[tokio::test]
    async fn all_models_failing_is_a_typed_error() {
        let provider = Arc::new(MockProvider::new());
        for model in ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash-lite"] {
            provider.enqueue(
                model,
                MockReply::Failure {
                    status: Some(503),
                    reason: "UNAVAILABLE".into(),
                },
            );
        }
        let fabric = fabric_with(Arc::clone(&provider));

        let err = fabric.generate("prompt", &options(1)).await.unwrap_err();
        match err {
            Error::AllModelsFailed { models_tried, .. } => assert_eq!(models_tried, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn preferred_model_starts_mid_chain() {
        let provider = Arc::new(MockProvider::new());
        provider.enqueue("gemini-2.5-flash", MockReply::Text("from flash".into()));
        let fabric = fabric_with(Arc::clone(&provider));

        let opts = GenerateOptions {
            preferred_model: Some("gemini-2.5-flash".into()),
            ..options(1)
        };
        let outcome = fabric.generate("prompt", &opts).await.unwrap();
        assert_eq!(outcome.model_used, "gemini-2.5-flash");
        assert!(outcome.is_fallback_mode);
        assert_eq!(provider.calls_for("gemini-2.5-pro"), 0);
    }

    #[tokio::test]
    async fn token_estimate_when_usage_absent() {
        assert_eq!(estimate_tokens("abcd", "efgh"), 2);
        assert_eq!(estimate_tokens("abc", ""), 1);
    }

    #[test]
    fn fence_stripping_handles_the_single_wrapper() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
