//! Bounded retry with exponential backoff
//!
//! Used for the two kinds of failure that a local retry can fix:
//! storage nodes that are briefly unreachable, and ledger objects that were
//! just written but are not yet visible through the indexed view. Everything
//! else (validation, signatures, denials) is returned on the first failure.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PressError, Result};

/// Retry budget and backoff shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay after the first failure
    pub initial_delay_ms: u64,

    /// Upper bound for the doubled delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Single attempt, no retries
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent.
///
/// When the budget runs out on a storage node failure the error is promoted
/// to the terminal [`PressError::StorageUnavailable`]. A lingering
/// [`PressError::ObjectNotFound`] is surfaced as is.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation, attempt = attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = operation,
                    attempts = attempt,
                    error = %e,
                    "Retry budget exhausted"
                );
                return Err(exhausted(e, attempt));
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Poll a lookup until the object becomes visible through the indexed view.
///
/// Thin wrapper over [`retry_transient`] so call sites read as what they do:
/// waiting out read-after-write lag.
pub async fn poll_visible<T, F, Fut>(policy: &RetryPolicy, what: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    debug!(object = what, "Polling for object visibility");
    retry_transient(policy, what, op).await
}

fn exhausted(error: PressError, attempts: u32) -> PressError {
    match error {
        PressError::NodeUnavailable(reason) => PressError::StorageUnavailable { attempts, reason },
        other => other,
    }
}
