//! Retry Coordination
//!
//! Wraps a fallible provider operation in bounded exponential backoff:
//!
//! ```text
//! delay(n) = min(base * 2^n + jitter, max_delay)
//! jitter   = base * 2^n * jitter_factor * u,   u ∈ [0, 1)
//! ```
//!
//! Network, timeout, rate-limit and service-unavailable errors are retried;
//! everything else fails immediately. A permanently failing retryable
//! operation runs `max_retries + 1` times in total.
//!
//! The jitter source is injectable so delays are reproducible under a fixed
//! seed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RetryConfig;
use crate::error::{DispatchError, ProviderError, Result};

// ============================================================================
// Jitter Sources
// ============================================================================

/// Supplies the random factor for backoff jitter
pub trait JitterSource: Send + Sync {
    /// A value in `[0, 1)`
    fn next_fraction(&self) -> f64;
}

/// Thread-local RNG; the default in production
#[derive(Debug, Default)]
pub struct ThreadJitter;

impl JitterSource for ThreadJitter {
    fn next_fraction(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic jitter from a seeded RNG
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    /// Create from a seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn next_fraction(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

/// No jitter at all
#[derive(Debug, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn next_fraction(&self) -> f64 {
        0.0
    }
}

// ============================================================================
// Retry Coordinator
// ============================================================================

/// Runs operations with exponential backoff
pub struct RetryCoordinator {
    config: RetryConfig,
    jitter: Arc<dyn JitterSource>,
    /// Retries made so far, keyed by `operation:error-kind`
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryCoordinator {
    /// Coordinator with thread-RNG jitter
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self::with_jitter(config, Arc::new(ThreadJitter))
    }

    /// Coordinator with a specific jitter source
    #[must_use]
    pub fn with_jitter(config: RetryConfig, jitter: Arc<dyn JitterSource>) -> Self {
        Self {
            config,
            jitter,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry number `attempt` (0-indexed)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(63)).unwrap_or(63);
        let exponential = self.config.base_delay_ms as f64 * 2f64.powi(exponent);
        let jitter = exponential * self.config.jitter_factor * self.jitter.next_fraction();
        // Within [0, max_delay_ms], so the cast only drops the fraction
        let capped = (exponential + jitter)
            .min(self.config.max_delay_ms as f64)
            .max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `operation` until it succeeds, fails fatally, or exhausts retries
    ///
    /// `operation` receives the 0-indexed attempt number.
    ///
    /// # Errors
    ///
    /// - `Provider` for a non-retryable error (no delay, no retry)
    /// - `RetryExhausted` wrapping the last error once the budget is spent
    pub async fn run<T, F, Fut>(&self, operation_id: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        let outcome = loop {
            match operation(attempt).await {
                Ok(value) => break Ok(value),
                Err(e) if !e.is_retryable() => {
                    tracing::debug!(operation = operation_id, error = %e, "Fatal error, not retrying");
                    break Err(DispatchError::Provider(e));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        tracing::warn!(
                            operation = operation_id,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                        break Err(DispatchError::RetryExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let key = format!("{operation_id}:{}", e.kind);
                    *self.attempts.lock().entry(key).or_insert(0) += 1;

                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        operation = operation_id,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.clear(operation_id);
        outcome
    }

    /// Retries recorded for an operation and error kind
    #[must_use]
    pub fn attempts_for(&self, key: &str) -> Option<u32> {
        self.attempts.lock().get(key).copied()
    }

    /// Operations with retries in progress
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.attempts.lock().len()
    }

    fn clear(&self, operation_id: &str) {
        let prefix = format!("{operation_id}:");
        self.attempts.lock().retain(|key, _| !key.starts_with(&prefix));
    }
}
