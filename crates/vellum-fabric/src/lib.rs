//! # vellum-fabric
//!
//! The LLM call fabric: every provider call in vellum is serialised through
//! this crate's admission pipeline.
//!
//! ```text
//! generate()
//!   └─ PriorityQueue (bounded, 3 levels, drop-lowest)
//!        └─ RateLimiter (token bucket with jitter)
//!             └─ ConnectionPool (bounded, validated sessions)
//!                  └─ model fallback chain
//!                       └─ retry + CircuitBreaker per model
//!                            └─ LlmProvider (Gemini HTTP or mock)
//! ```
//!
//! Successful attempts are recorded to the [`cost::CostLedger`]; failures
//! bubble out as `vellum-core` errors for the fingerprint classifier.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod breaker;
pub mod cost;
pub mod fabric;
pub mod pool;
pub mod provider;
pub mod queue;
pub mod rate_limit;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use cost::CostLedger;
pub use fabric::{FabricConfig, GenerateOptions, GenerateOutcome, LlmFabric};
pub use pool::{ConnectionPool, PoolConfig, SessionFactory};
pub use provider::{GeminiProvider, LlmProvider, MockProvider, ProviderResponse};
pub use queue::{Priority, PriorityQueue, QueueConfig};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
