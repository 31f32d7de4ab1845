//! Retry with exponential backoff for outbound calls
//!
//! Two pieces live here:
//! - [`RetryBudget`], the per-call attempt counter the resilient client drives
//!   from an explicit loop (separate budgets for 429s and transport failures)
//! - [`with_retry`], a generic wrapper for adapters whose errors classify
//!   themselves through [`RetryableError`]

use crate::config::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration, also caps server-provided Retry-After
    pub max_backoff: Duration,

    /// Backoff multiplier (2.0 for base x 2^attempt)
    pub multiplier: f64,

    /// Add random jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Build from the configuration file settings
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            ..Default::default()
        }
    }

    /// Create a config for quick retries (short backoff)
    pub fn quick() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Calculate backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let final_duration = if self.jitter {
            // 0-25% jitter
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(final_duration)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependency
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Failure class of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429, with the parsed Retry-After if the server sent one
    RateLimited { retry_after: Option<Duration> },
    /// Connection, TLS or timeout failure before any response arrived
    Transport,
}

/// Attempt counter for one logical call
///
/// Rate-limit and transport failures draw from separate budgets of
/// `max_retries` each.
#[derive(Debug)]
pub struct RetryBudget<'a> {
    config: &'a RetryConfig,
    rate_limited: u32,
    transport: u32,
}

impl<'a> RetryBudget<'a> {
    pub fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            rate_limited: 0,
            transport: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self, failure: FailureKind) -> Option<Duration> {
        match failure {
            FailureKind::RateLimited { retry_after } => {
                if self.rate_limited >= self.config.max_retries {
                    return None;
                }
                let delay = retry_after
                    .map(|d| d.min(self.config.max_backoff))
                    .unwrap_or_else(|| self.config.backoff_duration(self.rate_limited));
                self.rate_limited += 1;
                Some(delay)
            }
            FailureKind::Transport => {
                if self.transport >= self.config.max_retries {
                    return None;
                }
                let delay = self.config.backoff_duration(self.transport);
                self.transport += 1;
                Some(delay)
            }
        }
    }

    /// Retries spent so far across both classes
    pub fn retries_used(&self) -> u32 {
        self.rate_limited + self.transport
    }
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry after a specific duration (e.g., from Retry-After header)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    /// Determine if this error should be retried
    fn retry_decision(&self) -> RetryDecision;
}

/// Execute an async operation with retry logic
///
/// # Returns
/// The result of the operation, or the last error if all retries failed
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let decision = e.retry_decision();

                if decision == RetryDecision::NoRetry {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation failed with non-retryable error: {}",
                        e
                    );
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Operation failed after {} attempts: {}",
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }

                let backoff = match decision {
                    RetryDecision::RetryAfter(d) => d.min(config.max_backoff),
                    _ => config.backoff_duration(attempt),
                };

                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
