//! # Retry with Exponential Backoff
//!
//! Every remote call the crate makes goes through [`retry`] or [`retry_if`].
//! A [`RetryPolicy`] bounds the number of attempts, spaces them with an
//! exponentially growing delay and puts a timeout on each attempt.
//!
//! ```text
//! attempt 1 ──✗ transient──▶ sleep 5s ──▶ attempt 2 ──✗──▶ sleep 10s ──▶ attempt 3 ──✓
//!                                                                            │
//!                                                                       Ok(value)
//! attempt 1 ──✗ non-transient ─────────────────────────────────────▶ Err(error) as-is
//! attempt N ──✗ transient (last) ──────────────────▶ Err(RetriesExhausted { source })
//! ```
//!
//! Retried operations must be idempotent from the caller's point of view: a
//! page fetch re-issued with the same cursor returns the same rows, and a save
//! chunk re-sent is an upsert of the same payloads.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Attempts for one page fetch.
pub const DEFAULT_PAGE_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first page fetch retry.
pub const DEFAULT_PAGE_DELAY_MS: u64 = 5_000;

/// Per-attempt timeout for a page fetch.
pub const DEFAULT_PAGE_TIMEOUT_MS: u64 = 120_000;

/// Attempts for one mutation chunk.
pub const DEFAULT_MUTATION_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first mutation chunk retry.
pub const DEFAULT_MUTATION_DELAY_MS: u64 = 1_000;

/// Backoff growth factor.
pub const DEFAULT_DELAY_MULTIPLIER: f64 = 2.0;

/// How a retried operation is paced.
///
/// Durations are kept in milliseconds so the policy reads naturally from a
/// JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retrying.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay_ms: u64,
    /// Factor applied to the delay after each failed attempt.
    pub delay_multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay_ms: Option<u64>,
    /// Timeout for each individual attempt.
    pub timeout_ms: Option<u64>,
}

impl RetryPolicy {
    /// Policy for page fetches: 5 attempts, 5s doubling, 2 minute attempt timeout.
    pub fn page_fetch() -> Self {
        Self {
            max_attempts: DEFAULT_PAGE_MAX_ATTEMPTS,
            delay_ms: DEFAULT_PAGE_DELAY_MS,
            delay_multiplier: DEFAULT_DELAY_MULTIPLIER,
            max_delay_ms: None,
            timeout_ms: Some(DEFAULT_PAGE_TIMEOUT_MS),
        }
    }

    /// Policy for mutation chunks: 5 attempts, 1s doubling.
    pub fn mutation() -> Self {
        Self {
            max_attempts: DEFAULT_MUTATION_MAX_ATTEMPTS,
            delay_ms: DEFAULT_MUTATION_DELAY_MS,
            delay_multiplier: DEFAULT_DELAY_MULTIPLIER,
            max_delay_ms: None,
            timeout_ms: None,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::mutation()
        }
    }

    /// Per-attempt timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.delay_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let mut ms = (self.delay_ms as f64 * factor).min(u64::MAX as f64) as u64;
        if let Some(max) = self.max_delay_ms {
            ms = ms.min(max);
        }
        Duration::from_millis(ms)
    }

    pub(crate) fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(format!(
                "{section}.max_attempts must be at least 1"
            )));
        }
        if !self.delay_multiplier.is_finite() || self.delay_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "{section}.delay_multiplier must be a finite number >= 1"
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(format!(
                "{section}.timeout_ms must be positive when set"
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::mutation()
    }
}

// =============================================================================
// Retry Loops
// =============================================================================

/// Runs `op` until it succeeds, fails non-transiently, or runs out of attempts.
///
/// # Arguments
///
/// * `operation` - Name used in logs and in [`Error::RetriesExhausted`]
/// * `policy` - Attempts, backoff and per-attempt timeout
/// * `op` - Produces a fresh future for every attempt
///
/// # Errors
///
/// - The first non-transient error, unchanged
/// - [`Error::RetriesExhausted`] wrapping the last transient error
pub async fn retry<T, F, Fut>(operation: &str, policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(operation, policy, Error::is_transient, op).await
}

/// Like [`retry`], with a caller-supplied predicate deciding what to retry.
pub async fn retry_if<T, F, Fut, P>(
    operation: &str,
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let outcome = match policy.timeout() {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    after: limit,
                }),
            },
            None => op().await,
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }

        if attempt >= max_attempts {
            return Err(Error::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
