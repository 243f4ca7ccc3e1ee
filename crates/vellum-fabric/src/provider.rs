//! LLM provider abstraction.
//!
//! The required surface is a single `generate(prompt, model)` call
//! returning text plus optional token usage. [`GeminiProvider`] talks to
//! the Generative Language HTTP API; [`MockProvider`] serves scripted
//! responses for mock mode and tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use vellum_core::error::{Error, Result};

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the generated output.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Total tokens across prompt and output.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.prompt_tokens + self.output_tokens
    }
}

/// A provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Generated text.
    pub text: String,
    /// Provider-reported usage, when available.
    pub usage: Option<TokenUsage>,
}

/// The LLM provider surface. No streaming, no tool calling.
#[async_trait]
pub trait LlmProvider: Send + Sync + 'static {
    /// Generates text for a prompt with the named model.
    async fn generate(&self, prompt: &str, model: &str) -> Result<ProviderResponse>;

    /// Provider name, used in logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// HTTP client for the Gemini Generative Language API.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout_secs: u64,
}

impl GeminiProvider {
    /// Creates a provider with the given key and request deadline.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Overrides the endpoint base URL (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(&self, prompt: &str, model: &str) -> Result<ProviderResponse> {
        let url = format!(
            "{}/models/{model}:generateContent?key={}",
            self.base_url, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Deadline {
                        seconds: self.timeout_secs,
                    }
                } else {
                    Error::Network {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ApiErrorEnvelope>(&text)
                .ok()
                .and_then(|envelope| envelope.error)
                .map_or_else(
                    || status.canonical_reason().unwrap_or("error").to_string(),
                    |e| {
                        if e.status.is_empty() {
                            e.message
                        } else {
                            e.status
                        }
                    },
                );
            return Err(Error::Provider {
                status: Some(status.as_u16()),
                reason,
            });
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| Error::Provider {
            status: None,
            reason: format!("unparseable response: {e}"),
        })?;

        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(Error::Provider {
                status: None,
                reason: "empty candidate set".to_string(),
            });
        }

        let usage = parsed.usage_metadata.map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        });

        Ok(ProviderResponse { text, usage })
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

/// One scripted mock reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed with this text and estimated usage.
    Text(String),
    /// Fail as a provider error.
    Failure {
        /// HTTP status to report.
        status: Option<u16>,
        /// Provider reason string.
        reason: String,
    },
    /// Fail as a network error.
    Network(String),
}

#[derive(Default)]
struct MockState {
    scripted: HashMap<String, VecDeque<MockReply>>,
    calls: Vec<(String, String)>,
}

/// Scripted provider for mock mode and tests.
///
/// Replies are queued per model and consumed in order; a model with no
/// queued reply falls back to a deterministic default script payload.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    /// Creates an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for a model.
    pub fn enqueue(&self, model: &str, reply: MockReply) {
        self.lock()
            .scripted
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
    }

    /// All `(model, prompt)` pairs seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.lock().calls.clone()
    }

    /// Number of calls seen for one model.
    #[must_use]
    pub fn calls_for(&self, model: &str) -> usize {
        self.lock().calls.iter().filter(|(m, _)| m == model).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A deterministic minimal script payload that passes validation.
    #[must_use]
    pub fn default_script_payload() -> String {
        serde_json::json!({
            "title": "Generated draft",
            "segments": [
                {
                    "timestamp": "00:00",
                    "voiceover": "Opening narration.",
                    "visual_hint": "talking_head",
                    "estimated_duration_seconds": 10.0
                }
            ]
        })
        .to_string()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, prompt: &str, model: &str) -> Result<ProviderResponse> {
        let reply = {
            let mut state = self.lock();
            state.calls.push((model.to_string(), prompt.to_string()));
            state
                .scripted
                .get_mut(model)
                .and_then(VecDeque::pop_front)
        };

        match reply {
            None => Ok(ProviderResponse {
                text: Self::default_script_payload(),
                usage: Some(TokenUsage {
                    prompt_tokens: (prompt.len() / 4) as u64,
                    output_tokens: 64,
                }),
            }),
            Some(MockReply::Text(text)) => Ok(ProviderResponse {
                usage: Some(TokenUsage {
                    prompt_tokens: (prompt.len() / 4) as u64,
                    output_tokens: (text.len() / 4) as u64,
                }),
                text,
            }),
            Some(MockReply::Failure { status, reason }) => Err(Error::Provider { status, reason }),
            Some(MockReply::Network(message)) => Err(Error::Network { message }),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
