//! Token-bucket admission with jittered waits.
//!
//! One bucket guards the shared provider ceiling. Waits are jittered so a
//! burst of callers released at the same instant does not re-arrive at the
//! same instant; parameters are fixed at construction.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Bucket capacity in tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,
    /// Refill rate in tokens per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Multiplicative jitter factor applied to waits, in `[0, 1)`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

const fn default_max_tokens() -> f64 {
    60.0
}

const fn default_refill_per_sec() -> f64 {
    1.0
}

const fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_per_sec: default_refill_per_sec(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RateLimiterConfig {
    /// Derives a config from a requests-per-minute ceiling: a burst bucket
    /// of one minute's worth of tokens refilled evenly across the minute.
    #[must_use]
    pub fn from_rpm(rpm: u64) -> Self {
        let rpm = rpm.max(1) as f64;
        Self {
            max_tokens: rpm,
            refill_per_sec: rpm / 60.0,
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter.
///
/// `acquire` suspends until a token is available; `available` reports the
/// whole tokens currently in the bucket. No parameter changes after
/// construction.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a full bucket with the given configuration.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquires one token, sleeping with jitter while the bucket is empty.
    ///
    /// The wait is `(1 - tokens) / refill_rate` scaled by a uniform factor
    /// in `[1 - j, 1 + j]`. Re-entry after the sleep retries; under
    /// uncontended load one re-entry is sufficient.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let base = (1.0 - bucket.tokens) / self.config.refill_per_sec;
                let jitter = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(
                        1.0 - self.config.jitter_factor..=1.0 + self.config.jitter_factor,
                    )
                };
                Duration::from_secs_f64((base * jitter).max(0.001))
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available.
    #[must_use]
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens.floor().max(0.0) as u64
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.max_tokens);
        bucket.last_refill = now;
    }
}
