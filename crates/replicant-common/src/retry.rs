//! Retry utilities with exponential backoff and jitter.
//!
//! Two consumers:
//! - [`retry_with_backoff`] wraps one-shot startup calls (CRD install) that
//!   should ride out a briefly unavailable API server.
//! - [`RequeueBackoff`] feeds the controller's error policy. The reconciler
//!   itself never retries; a failed pass is requeued by the dispatcher with a
//!   delay that grows per object key and resets once a pass succeeds.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Configuration for exponential backoff
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Scale `delay` by a random factor in 0.5..1.5, capped at `max`
fn jitter(delay: Duration, max: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor).min(max)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is reached when set, in
/// which case the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = jitter(config.delay_for(attempt - 1), config.max_delay);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Per-key requeue delays for a controller's error policy
///
/// Keys are object references (`namespace/name`). Each consecutive failure
/// for a key doubles its delay up to `max_delay`.
#[derive(Debug, Default)]
pub struct RequeueBackoff {
    config: RetryConfig,
    failures: DashMap<String, u32>,
}

impl RequeueBackoff {
    /// Create a backoff tracker with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = self.config.delay_for(*failures);
        *failures = failures.saturating_add(1);
        jitter(delay, self.config.max_delay)
    }

    /// Forget the failure history of `key` after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures currently recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }
}
