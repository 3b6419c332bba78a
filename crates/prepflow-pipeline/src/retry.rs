//! Backoff policies and bounded retry for collaborator calls and retryable nodes.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use prepflow_types::{PrepflowError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let millis = base_ms.saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis.min(*max_ms))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

/// Call `f` up to `max_retries + 1` times, retrying while the error satisfies
/// [`PrepflowError::is_retryable`]. Sleeps per `policy` between attempts.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    operation: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..=max_retries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(operation, attempt, delay_ms = %delay.as_millis(), error = %e, "Retryable error, retrying");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        PrepflowError::Other(format!(
            "{operation}: retries exhausted after {} attempts",
            max_retries + 1
        ))
    }))
}
